// build.rs — emit link directives for METIS when `metis-support` is enabled.
//
// Discovery mirrors the manual mode of the usual pkg-config dance: point
// METIS_DIR (or METIS_LIB_DIR) at an installation prefix; otherwise the
// system linker paths are used.

fn main() {
    if std::env::var_os("CARGO_FEATURE_METIS_SUPPORT").is_some() {
        if let Ok(prefix) = std::env::var("METIS_DIR") {
            println!("cargo:rustc-link-search=native={}/lib", prefix);
        }
        if let Ok(lib_dir) = std::env::var("METIS_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", lib_dir);
        }
        println!("cargo:rustc-link-lib=dylib=metis");
        println!("cargo:rerun-if-env-changed=METIS_DIR");
        println!("cargo:rerun-if-env-changed=METIS_LIB_DIR");
    }
}
