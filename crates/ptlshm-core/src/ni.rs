//! Raw network-interface primitives the bootstrap runs on
//!
//! These are provided by the network layer; this crate only consumes them.
//! [`crate::loopback`] has an in-process implementation.

use crate::process_id::ProcessId;
use crate::Result;
use bitflags::bitflags;
use std::time::Duration;

bitflags! {
    /// Options for a receive (list entry) registration
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvOptions: u32 {
        /// Accept remote puts
        const OP_PUT = 1 << 0;
        /// Accept remote gets
        const OP_GET = 1 << 1;
        /// Unlink after the first matching operation
        const USE_ONCE = 1 << 2;
        /// Count puts on the attached counter
        const COUNT_PUT = 1 << 3;
        /// Count gets on the attached counter
        const COUNT_GET = 1 << 4;
    }
}

bitflags! {
    /// Options for a bound send (memory descriptor)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendOptions: u32 {
        /// Count acknowledgements on the attached counter
        const COUNT_ACK = 1 << 0;
        /// Do not deliver completion events
        const EVENT_DISABLE = 1 << 1;
    }
}

/// Acknowledgement requested from the target of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRequest {
    None,
    /// Acknowledge into the initiator's completion counter
    Counter,
}

/// Snapshot of a completion counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterEvent {
    pub success: u64,
    pub failure: u64,
}

impl CounterEvent {
    pub fn failed(&self) -> bool {
        self.failure > 0
    }
}

/// Atomic, waitable success/failure counter
pub trait CompletionCounter {
    fn get(&self) -> CounterEvent;

    /// Block until `success >= threshold` or a failure is recorded
    fn wait(&self, threshold: u64) -> CounterEvent;

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    fn wait_timeout(&self, threshold: u64, timeout: Duration) -> Option<CounterEvent>;
}

/// Address-based (physical) network interface
///
/// Receive buffers are handed over at registration and returned on unlink.
pub trait RawInterface {
    type Counter: CompletionCounter;
    /// Handle of an appended receive registration
    type RecvHandle;
    /// Handle of a bound send buffer
    type SendHandle;

    /// Transport address of this interface
    fn id(&self) -> ProcessId;

    fn counter_alloc(&self) -> Result<Self::Counter>;
    fn counter_free(&self, counter: Self::Counter) -> Result<()>;

    /// Append `buffer` to the receive list, counting on `counter`
    fn append_receive(
        &self,
        buffer: Vec<u8>,
        options: RecvOptions,
        counter: &Self::Counter,
    ) -> Result<Self::RecvHandle>;

    /// Remove a receive registration and take its buffer back
    fn unlink_receive(&self, recv: Self::RecvHandle) -> Result<Vec<u8>>;

    /// Bind `data` for sending, counting on `counter`
    fn bind_send(
        &self,
        data: Vec<u8>,
        options: SendOptions,
        counter: &Self::Counter,
    ) -> Result<Self::SendHandle>;
    fn release_send(&self, send: Self::SendHandle) -> Result<()>;

    /// Write `len` bytes at `local_offset` of `send` to `target` at `remote_offset`
    fn put(
        &self,
        send: &Self::SendHandle,
        local_offset: usize,
        len: usize,
        ack: AckRequest,
        target: ProcessId,
        remote_offset: usize,
    ) -> Result<()>;

    /// Close the interface
    fn fini(self) -> Result<()>;
}
