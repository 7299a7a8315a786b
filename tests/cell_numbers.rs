//! Checks that the number of local cells on each process is meaningful,
//! for every partitioner and before and after repartitioning.

use rand::{Rng, SeedableRng};
use repa::comm::{Communicator, ThreadComm};
use repa::grids::{make_grid, GridType};

fn on_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ThreadComm) -> T + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = ThreadComm::group(size)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            std::thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn is_close(a: f64, b: f64) -> bool {
    ((a - b) / a.min(b)).abs() < 1e-14
}

const KINDS: [GridType; 3] = [
    GridType::Diffusion,
    GridType::SpaceFillingCurve,
    GridType::Graph,
];

#[test]
fn cell_numbers_are_conserved() {
    for kind in KINDS {
        for nranks in [1usize, 4, 8] {
            let results = on_ranks(nranks, move |comm| {
                let rank = comm.rank();
                let mut grid = make_grid(kind, comm, [1.0, 1.0, 1.0], 0.125).unwrap();

                let before = grid.n_local_cells();
                assert!(grid.grid_size().iter().all(|&n| n > 0));
                for d in 0..3 {
                    assert!(grid.cell_size()[d] > 0.0);
                    assert!(is_close(
                        f64::from(grid.grid_size()[d]) * grid.cell_size()[d],
                        1.0
                    ));
                }

                // Unbalanced, per-rank reproducible weights.
                let mut rng = rand::rngs::StdRng::seed_from_u64(rank as u64);
                let weights: Vec<f64> = (0..before)
                    .map(|_| (rank + 1) as f64 * rng.gen_range(0.5..1.5))
                    .collect();
                grid.repartition(&move || weights.clone(), &mut |_| {}).unwrap();

                (before, grid.n_local_cells())
            });

            let total_before: usize = results.iter().map(|(b, _)| b).sum();
            let total_after: usize = results.iter().map(|(_, a)| a).sum();
            assert_eq!(total_before, 512, "{kind:?} on {nranks} ranks");
            assert_eq!(total_after, 512, "{kind:?} on {nranks} ranks");
            assert!(
                results.iter().all(|&(_, a)| a > 0),
                "{kind:?} on {nranks} ranks left a rank empty"
            );
        }
    }
}

#[test]
fn one_cell_per_rank() {
    // The smallest meaningful configuration: a 2x2x2 grid on 8 ranks.
    for kind in KINDS {
        let results = on_ranks(8, move |comm| {
            let grid = make_grid(kind, comm, [1.0, 1.0, 1.0], 0.5).unwrap();
            (
                grid.n_local_cells(),
                grid.n_ghost_cells(),
                grid.neighbor_ranks().len(),
            )
        });
        for (rank, &(nlocal, nghost, nneigh)) in results.iter().enumerate() {
            assert_eq!(nlocal, 1, "{kind:?} rank {rank}");
            // Every other cell of the 2x2x2 grid is a ghost.
            assert_eq!(nghost, 7, "{kind:?} rank {rank}");
            assert_eq!(nneigh, 7, "{kind:?} rank {rank}");
        }
    }
}

#[test]
fn single_rank_grid_has_no_boundary() {
    for kind in KINDS {
        let results = on_ranks(1, move |comm| {
            let grid = make_grid(kind, comm, [1.0, 1.0, 1.0], 0.5).unwrap();
            (
                grid.n_local_cells(),
                grid.n_ghost_cells(),
                grid.get_boundary_info().len(),
            )
        });
        assert_eq!(results[0], (8, 0, 0), "{kind:?}");
    }
}
