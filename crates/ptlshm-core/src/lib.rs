//! ptlshm - shared-memory bootstrap for a Portals-style network interface
//!
//! Two pieces: a process-wide init/fini barrier that maps the node-local
//! communication pad exactly once per process, and the rank-discovery
//! handshake that turns raw transport addresses into a rank-indexed table.

pub mod barrier;
pub mod bootstrap;
pub mod error;
pub mod layout;
pub mod logical;
pub mod loopback;
pub mod ni;
pub mod params;
pub mod process_id;
pub mod region;
pub mod shm;
pub mod table;
pub mod wait;

pub use barrier::{
    fini, init, process_barrier, with_comm_pad, BarrierStats, InitBarrier, PadGuard, Phase,
};
pub use bootstrap::{bootstrap, collect_and_distribute, BootstrapConfig};
pub use error::{Error, Result};
pub use layout::RegionLayout;
pub use logical::{bootstrap_logical, LogicalInterfaceFactory, RankMap, RankMapFactory};
pub use ni::{
    AckRequest, CompletionCounter, CounterEvent, RawInterface, RecvOptions, SendOptions,
};
pub use params::{LaunchParams, NiLimits};
pub use process_id::{ProcessId, ADDRESS_SIZE, PID_ANY};
pub use region::CommPad;
pub use table::AddressTable;
pub use wait::{BoundedSpin, Spin, SpinThenYield, WaitStrategy};
