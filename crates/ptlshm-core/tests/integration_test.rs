//! Cross-process tests
//!
//! Uses fork() to run real sibling processes against one communication pad.

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use ptlshm_core::params::page_size;
    use ptlshm_core::shm::SharedMemory;
    use ptlshm_core::{CommPad, InitBarrier, LaunchParams, RegionLayout};

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/ptlshm_test_{}", ts)
    }

    /// Check whether the WaitStatus is a clean exit
    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    /// Run `body` in a forked child; never returns in the child
    ///
    /// The child leaves via `exit` so the launcher's handle, copied by fork,
    /// is never dropped (and the object never unlinked) from the child.
    fn spawn_sibling<F: FnOnce()>(body: F) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match catch_unwind(AssertUnwindSafe(body)) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => child,
        }
    }

    /// Launcher creates the pad, every sibling meets at the barrier
    #[test]
    fn test_siblings_meet_across_processes() {
        const SIBLINGS: usize = 3;
        let name = unique_name();
        let layout = RegionLayout::new(page_size(), SIBLINGS, 4096).unwrap();
        let _launcher = SharedMemory::create(&name, layout.total_size()).unwrap();

        let children: Vec<Pid> = (1..SIBLINGS)
            .map(|rank| {
                let name = name.clone();
                spawn_sibling(move || {
                    let barrier = InitBarrier::new();
                    let guard = barrier
                        .acquire_with(|| LaunchParams::new(&name, SIBLINGS, rank, 4096))
                        .unwrap();
                    assert!(guard.all_arrived());
                })
            })
            .collect();

        let barrier = InitBarrier::new();
        let guard = barrier
            .acquire_with(|| LaunchParams::new(&name, SIBLINGS, 0, 4096))
            .unwrap();
        assert!(guard.all_arrived());
        assert_eq!(guard.limits().max_msg_size, 4096);
        drop(guard);

        for child in children {
            let status = waitpid(child, None).unwrap();
            assert!(is_exit_success(status));
        }
    }

    /// Data a sibling writes before arriving is visible once the barrier opens
    #[test]
    fn test_buffer_visible_after_barrier() {
        let name = unique_name();
        let layout = RegionLayout::new(page_size(), 2, 256).unwrap();
        let _launcher = SharedMemory::create(&name, layout.total_size()).unwrap();
        let message = b"Hello from rank 1!";

        let child = {
            let name = name.clone();
            spawn_sibling(move || {
                let pad = CommPad::open(&name, layout).unwrap();
                unsafe { pad.write_buffer(1, 0, message).unwrap() };
                let barrier = InitBarrier::new();
                let _guard = barrier
                    .acquire_with(|| LaunchParams::new(&name, 2, 1, 256))
                    .unwrap();
            })
        };

        let barrier = InitBarrier::new();
        let guard = barrier
            .acquire_with(|| LaunchParams::new(&name, 2, 0, 256))
            .unwrap();
        let mut read = [0u8; 18];
        guard.read_buffer(1, 0, &mut read).unwrap();
        assert_eq!(&read, message);
        drop(guard);

        let status = waitpid(child, None).unwrap();
        assert!(is_exit_success(status));
    }
}
