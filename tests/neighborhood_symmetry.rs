//! Checks the symmetry of the process neighborhood relation.

use repa::comm::{Communicator, ThreadComm};
use repa::grids::{make_grid, GridType};
use repa::index::Rank;

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

fn assert_symmetric(neighborhoods: &[Vec<Rank>]) {
    for (rank, neighbors) in neighborhoods.iter().enumerate() {
        // Uniqueness: the list is strictly ascending.
        assert!(
            neighbors.windows(2).all(|w| w[0] < w[1]),
            "rank {rank} has unsorted or duplicate neighbors: {neighbors:?}"
        );
        assert!(
            !neighbors.contains(&Rank::new(rank as u32)),
            "rank {rank} lists itself as a neighbor"
        );
        for other in neighbors {
            assert!(
                neighborhoods[other.index()].contains(&Rank::new(rank as u32)),
                "rank {other} does not know neighbor {rank}"
            );
        }
    }
}

#[test]
fn process_neighborhoods_are_symmetric() {
    for kind in [
        GridType::Diffusion,
        GridType::SpaceFillingCurve,
        GridType::Graph,
    ] {
        for nranks in [2usize, 4, 8] {
            let neighborhoods = on_ranks(nranks, move |comm| {
                let rank = comm.rank();
                let mut grid = make_grid(kind, comm, [1.0, 1.0, 1.0], 0.125).unwrap();
                let before = grid.neighbor_ranks().to_vec();

                // Skew the load so a repartition actually moves cells,
                // then re-check on the new layout.
                let n = grid.n_local_cells();
                let w = (rank + 1) as f64;
                grid.repartition(&move || vec![w; n], &mut |_| {}).unwrap();
                (before, grid.neighbor_ranks().to_vec())
            });

            let before: Vec<_> = neighborhoods.iter().map(|(b, _)| b.clone()).collect();
            let after: Vec<_> = neighborhoods.iter().map(|(_, a)| a.clone()).collect();
            assert_symmetric(&before);
            assert_symmetric(&after);
        }
    }
}
