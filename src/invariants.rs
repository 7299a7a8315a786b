//! Always-on invariant checks.
//!
//! Unlike `debug_assert!`, these fire in release builds as well: the checks
//! guard the consistency of the replicated partition map, and a violation
//! that slipped through would corrupt ownership silently on remote ranks.

/// Abort with a diagnostic if `cond` does not hold. Active in all profiles.
macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            panic!(
                "invariant violated: `{}': {}",
                stringify!($cond),
                format_args!($($msg)+)
            );
        }
    };
}

/// Abort; marks control flow that must be unreachable in a consistent state.
macro_rules! ensure_unreachable {
    ($($msg:tt)+) => {
        panic!("logic error, must not be reached: {}", format_args!($($msg)+))
    };
}

pub(crate) use ensure;
pub(crate) use ensure_unreachable;
