//! A sibling process joining the group from the launch environment
//!
//! Usage (the launcher normally sets these and creates the object):
//! ```bash
//! PORTALS4_SHM_NAME=/ptl_demo PORTALS4_NUM_PROCS=1 PORTALS4_RANK=0 \
//!     PORTALS4_COMM_SIZE=65536 cargo run --example rank
//! ```

fn main() -> Result<(), Box<dyn std::error::Error>> {
    ptlshm_core::init()?;

    ptlshm_core::with_comm_pad(|pad| {
        println!(
            "rank {} of {} mapped {} ({} bytes)",
            pad.rank(),
            pad.num_siblings(),
            pad.name(),
            pad.layout().total_size()
        );
        println!("max message size: {}", pad.limits().max_msg_size);
    })?;

    ptlshm_core::fini()?;
    Ok(())
}
