//! A whole group in one process: each thread plays one sibling
//!
//! The main thread acts as the launcher and creates the communication pad.
//!
//! ```bash
//! cargo run --example group
//! ```

use ptlshm_core::loopback::LoopbackFabric;
use ptlshm_core::params::page_size;
use ptlshm_core::shm::SharedMemory;
use ptlshm_core::{
    bootstrap, BootstrapConfig, InitBarrier, LaunchParams, RawInterface, RegionLayout,
};
use std::thread;

const SIBLINGS: usize = 4;
const COMM_SIZE: usize = 4096;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let name = "/ptlshm_group_demo";
    let layout = RegionLayout::new(page_size(), SIBLINGS, COMM_SIZE)?;
    let _launcher = SharedMemory::create(name, layout.total_size())?;

    let fabric = LoopbackFabric::new();
    let nis: Vec<_> = (0..SIBLINGS).map(|_| fabric.open(0)).collect();
    let collector = nis[0].id();

    let results = thread::scope(|s| {
        let handles: Vec<_> = nis
            .into_iter()
            .enumerate()
            .map(|(rank, ni)| {
                let fabric = &fabric;
                s.spawn(move || -> ptlshm_core::Result<()> {
                    let barrier = InitBarrier::new();
                    let pad = barrier
                        .acquire_with(|| LaunchParams::new(name, SIBLINGS, rank, COMM_SIZE))?;

                    let config = BootstrapConfig::new(SIBLINGS, rank, collector)?;
                    if rank != 0 {
                        fabric.wait_for_receive(collector);
                    }
                    let table = bootstrap(ni, &config)?;
                    let peers: Vec<String> = table.iter().map(|id| id.to_string()).collect();
                    println!(
                        "rank {} ({} siblings arrived): {}",
                        pad.rank(),
                        pad.num_siblings(),
                        peers.join(" ")
                    );
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("sibling thread panicked"))
            .collect::<Vec<_>>()
    });

    for result in results {
        result?;
    }
    Ok(())
}
