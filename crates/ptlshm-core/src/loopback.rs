//! In-process implementation of the raw interface primitives
//!
//! Every [`LoopbackInterface`] opened on one [`LoopbackFabric`] can reach
//! every other. Puts are delivered synchronously: a put either lands in a
//! matching receive registration of the target before `put` returns, or it
//! is dropped and the initiator's counter records a failure.

use crate::ni::{
    AckRequest, CompletionCounter, CounterEvent, RawInterface, RecvOptions, SendOptions,
};
use crate::process_id::ProcessId;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-interface resource accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub counters_allocated: usize,
    pub counters_freed: usize,
    pub receives_appended: usize,
    pub receives_unlinked: usize,
    pub sends_bound: usize,
    pub sends_released: usize,
}

impl ResourceStats {
    /// Whether everything allocated was also given back
    pub fn balanced(&self) -> bool {
        self.counters_allocated == self.counters_freed
            && self.receives_appended == self.receives_unlinked
            && self.sends_bound == self.sends_released
    }
}

#[derive(Default)]
struct StatCounters {
    counters_allocated: AtomicUsize,
    counters_freed: AtomicUsize,
    receives_appended: AtomicUsize,
    receives_unlinked: AtomicUsize,
    sends_bound: AtomicUsize,
    sends_released: AtomicUsize,
}

impl StatCounters {
    fn snapshot(&self) -> ResourceStats {
        ResourceStats {
            counters_allocated: self.counters_allocated.load(Ordering::Relaxed),
            counters_freed: self.counters_freed.load(Ordering::Relaxed),
            receives_appended: self.receives_appended.load(Ordering::Relaxed),
            receives_unlinked: self.receives_unlinked.load(Ordering::Relaxed),
            sends_bound: self.sends_bound.load(Ordering::Relaxed),
            sends_released: self.sends_released.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct CounterState {
    event: Mutex<CounterEvent>,
    cond: Condvar,
}

/// Completion counter shared between an interface and its registrations
#[derive(Clone, Default)]
pub struct LoopbackCounter {
    state: Arc<CounterState>,
}

impl LoopbackCounter {
    fn succeed(&self) {
        self.state.event.lock().success += 1;
        self.state.cond.notify_all();
    }

    fn fail(&self) {
        self.state.event.lock().failure += 1;
        self.state.cond.notify_all();
    }
}

impl CompletionCounter for LoopbackCounter {
    fn get(&self) -> CounterEvent {
        *self.state.event.lock()
    }

    fn wait(&self, threshold: u64) -> CounterEvent {
        let mut event = self.state.event.lock();
        while event.success < threshold && !event.failed() {
            self.state.cond.wait(&mut event);
        }
        *event
    }

    fn wait_timeout(&self, threshold: u64, timeout: Duration) -> Option<CounterEvent> {
        let deadline = Instant::now() + timeout;
        let mut event = self.state.event.lock();
        while event.success < threshold && !event.failed() {
            if self.state.cond.wait_until(&mut event, deadline).timed_out() {
                return None;
            }
        }
        Some(*event)
    }
}

struct Registration {
    handle: u64,
    buffer: Vec<u8>,
    options: RecvOptions,
    counter: LoopbackCounter,
    consumed: bool,
}

impl Registration {
    fn accepts_put(&self, offset: usize, len: usize) -> bool {
        !self.consumed
            && self.options.contains(RecvOptions::OP_PUT)
            && offset
                .checked_add(len)
                .map_or(false, |end| end <= self.buffer.len())
    }
}

struct Endpoint {
    id: ProcessId,
    receives: Mutex<Vec<Registration>>,
    next_handle: AtomicU64,
    stats: Arc<StatCounters>,
}

#[derive(Default)]
struct FabricInner {
    endpoints: Mutex<HashMap<ProcessId, Arc<Endpoint>>>,
    stats: Mutex<HashMap<ProcessId, Arc<StatCounters>>>,
    failing: Mutex<HashSet<ProcessId>>,
    next_pid: AtomicU32,
}

/// A set of interfaces that can reach each other
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an interface on node `nid` with the next free pid
    pub fn open(&self, nid: u32) -> LoopbackInterface {
        loop {
            let pid = self.inner.next_pid.fetch_add(1, Ordering::Relaxed);
            if let Ok(ni) = self.open_with_id(ProcessId::new(nid, pid)) {
                return ni;
            }
        }
    }

    /// Open an interface at a fixed address
    pub fn open_with_id(&self, id: ProcessId) -> Result<LoopbackInterface> {
        let mut endpoints = self.inner.endpoints.lock();
        if endpoints.contains_key(&id) {
            return Err(Error::Interface(format!("address {} already in use", id)));
        }
        let stats = Arc::new(StatCounters::default());
        let endpoint = Arc::new(Endpoint {
            id,
            receives: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(0),
            stats: stats.clone(),
        });
        endpoints.insert(id, endpoint.clone());
        self.inner.stats.lock().insert(id, stats);

        tracing::trace!(%id, "loopback interface opened");
        Ok(LoopbackInterface {
            fabric: self.clone(),
            endpoint,
        })
    }

    /// Resource accounting of the interface at `id`, also after it closed
    pub fn stats(&self, id: ProcessId) -> Option<ResourceStats> {
        self.inner.stats.lock().get(&id).map(|stats| stats.snapshot())
    }

    /// Drop every later put targeting `id`
    pub fn fail_puts_to(&self, id: ProcessId) {
        self.inner.failing.lock().insert(id);
    }

    /// Whether `id` currently has a receive registration accepting puts
    pub fn has_receive(&self, id: ProcessId) -> bool {
        let endpoint = self.inner.endpoints.lock().get(&id).cloned();
        endpoint.map_or(false, |endpoint| {
            endpoint
                .receives
                .lock()
                .iter()
                .any(|recv| !recv.consumed && recv.options.contains(RecvOptions::OP_PUT))
        })
    }

    /// Block until `id` can accept puts
    pub fn wait_for_receive(&self, id: ProcessId) {
        while !self.has_receive(id) {
            std::thread::yield_now();
        }
    }

    fn deliver(&self, target: ProcessId, offset: usize, data: &[u8]) -> bool {
        if self.inner.failing.lock().contains(&target) {
            tracing::trace!(%target, "put dropped by failure injection");
            return false;
        }
        let endpoint = match self.inner.endpoints.lock().get(&target) {
            Some(endpoint) => endpoint.clone(),
            None => return false,
        };

        let mut receives = endpoint.receives.lock();
        let Some(recv) = receives
            .iter_mut()
            .find(|recv| recv.accepts_put(offset, data.len()))
        else {
            tracing::trace!(%target, offset, len = data.len(), "put matched no receive");
            return false;
        };
        recv.buffer[offset..offset + data.len()].copy_from_slice(data);
        if recv.options.contains(RecvOptions::USE_ONCE) {
            recv.consumed = true;
        }
        if recv.options.contains(RecvOptions::COUNT_PUT) {
            recv.counter.succeed();
        }
        true
    }
}

/// Handle of a receive registration on a [`LoopbackInterface`]
#[derive(Debug)]
pub struct LoopbackRecv {
    handle: u64,
}

/// A bound send buffer on a [`LoopbackInterface`]
pub struct LoopbackSend {
    data: Vec<u8>,
    options: SendOptions,
    counter: LoopbackCounter,
}

/// One address-based interface on a [`LoopbackFabric`]
pub struct LoopbackInterface {
    fabric: LoopbackFabric,
    endpoint: Arc<Endpoint>,
}

impl RawInterface for LoopbackInterface {
    type Counter = LoopbackCounter;
    type RecvHandle = LoopbackRecv;
    type SendHandle = LoopbackSend;

    fn id(&self) -> ProcessId {
        self.endpoint.id
    }

    fn counter_alloc(&self) -> Result<LoopbackCounter> {
        self.endpoint
            .stats
            .counters_allocated
            .fetch_add(1, Ordering::Relaxed);
        Ok(LoopbackCounter::default())
    }

    fn counter_free(&self, _counter: LoopbackCounter) -> Result<()> {
        self.endpoint
            .stats
            .counters_freed
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn append_receive(
        &self,
        buffer: Vec<u8>,
        options: RecvOptions,
        counter: &LoopbackCounter,
    ) -> Result<LoopbackRecv> {
        let handle = self.endpoint.next_handle.fetch_add(1, Ordering::Relaxed);
        self.endpoint.receives.lock().push(Registration {
            handle,
            buffer,
            options,
            counter: counter.clone(),
            consumed: false,
        });
        self.endpoint
            .stats
            .receives_appended
            .fetch_add(1, Ordering::Relaxed);
        Ok(LoopbackRecv { handle })
    }

    fn unlink_receive(&self, recv: LoopbackRecv) -> Result<Vec<u8>> {
        let mut receives = self.endpoint.receives.lock();
        let index = receives
            .iter()
            .position(|entry| entry.handle == recv.handle)
            .ok_or_else(|| Error::Interface(format!("unknown receive {}", recv.handle)))?;
        let entry = receives.remove(index);
        self.endpoint
            .stats
            .receives_unlinked
            .fetch_add(1, Ordering::Relaxed);
        Ok(entry.buffer)
    }

    fn bind_send(
        &self,
        data: Vec<u8>,
        options: SendOptions,
        counter: &LoopbackCounter,
    ) -> Result<LoopbackSend> {
        self.endpoint.stats.sends_bound.fetch_add(1, Ordering::Relaxed);
        Ok(LoopbackSend {
            data,
            options,
            counter: counter.clone(),
        })
    }

    fn release_send(&self, _send: LoopbackSend) -> Result<()> {
        self.endpoint
            .stats
            .sends_released
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn put(
        &self,
        send: &LoopbackSend,
        local_offset: usize,
        len: usize,
        ack: AckRequest,
        target: ProcessId,
        remote_offset: usize,
    ) -> Result<()> {
        let data = local_offset
            .checked_add(len)
            .and_then(|end| send.data.get(local_offset..end))
            .ok_or_else(|| {
                Error::Interface(format!(
                    "put of {}+{} exceeds {} byte send buffer",
                    local_offset,
                    len,
                    send.data.len()
                ))
            })?;

        let delivered = self.fabric.deliver(target, remote_offset, data);
        if ack == AckRequest::Counter && send.options.contains(SendOptions::COUNT_ACK) {
            if delivered {
                send.counter.succeed();
            } else {
                send.counter.fail();
            }
        }
        Ok(())
    }

    fn fini(self) -> Result<()> {
        self.fabric.inner.endpoints.lock().remove(&self.endpoint.id);
        tracing::trace!(id = %self.endpoint.id, "loopback interface closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_put_lands_and_counts() {
        let fabric = LoopbackFabric::new();
        let a = fabric.open(0);
        let b = fabric.open(0);

        let recv_ct = b.counter_alloc().unwrap();
        let recv = b
            .append_receive(vec![0; 16], RecvOptions::OP_PUT | RecvOptions::COUNT_PUT, &recv_ct)
            .unwrap();

        let send_ct = a.counter_alloc().unwrap();
        let send = a
            .bind_send(b"abcd".to_vec(), SendOptions::COUNT_ACK, &send_ct)
            .unwrap();
        a.put(&send, 0, 4, AckRequest::Counter, b.id(), 8).unwrap();

        assert_eq!(send_ct.wait(1), CounterEvent { success: 1, failure: 0 });
        assert_eq!(recv_ct.get().success, 1);
        assert_eq!(&b.unlink_receive(recv).unwrap()[8..12], b"abcd");
    }

    #[test]
    fn test_use_once_matches_once() {
        let fabric = LoopbackFabric::new();
        let a = fabric.open(0);
        let b = fabric.open(0);

        let recv_ct = b.counter_alloc().unwrap();
        let recv = b
            .append_receive(
                vec![0; 4],
                RecvOptions::OP_PUT | RecvOptions::USE_ONCE | RecvOptions::COUNT_PUT,
                &recv_ct,
            )
            .unwrap();
        assert!(fabric.has_receive(b.id()));

        let send_ct = a.counter_alloc().unwrap();
        let send = a.bind_send(vec![9; 4], SendOptions::COUNT_ACK, &send_ct).unwrap();
        a.put(&send, 0, 4, AckRequest::Counter, b.id(), 0).unwrap();
        a.put(&send, 0, 4, AckRequest::Counter, b.id(), 0).unwrap();

        assert_eq!(send_ct.get(), CounterEvent { success: 1, failure: 1 });
        assert!(!fabric.has_receive(b.id()));
        assert_eq!(b.unlink_receive(recv).unwrap(), vec![9; 4]);
    }

    #[test]
    fn test_unknown_target_fails_ack() {
        let fabric = LoopbackFabric::new();
        let a = fabric.open(0);
        let ct = a.counter_alloc().unwrap();
        let send = a.bind_send(vec![1], SendOptions::COUNT_ACK, &ct).unwrap();
        a.put(&send, 0, 1, AckRequest::Counter, ProcessId::new(9, 9), 0)
            .unwrap();
        assert!(ct.wait(1).failed());
        assert!(a.put(&send, 0, 2, AckRequest::Counter, a.id(), 0).is_err());
    }

    #[test]
    fn test_wait_blocks_until_threshold() {
        let ct = LoopbackCounter::default();
        let bumper = {
            let ct = ct.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    ct.succeed();
                }
            })
        };
        assert!(ct.wait(3).success >= 3);
        bumper.join().unwrap();
        assert!(ct.wait_timeout(4, Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_stats_survive_fini() {
        let fabric = LoopbackFabric::new();
        let ni = fabric.open(0);
        let id = ni.id();
        let ct = ni.counter_alloc().unwrap();
        ni.counter_free(ct).unwrap();
        ni.fini().unwrap();

        let stats = fabric.stats(id).unwrap();
        assert_eq!(stats.counters_allocated, 1);
        assert!(stats.balanced());
        assert!(fabric.open_with_id(id).is_ok());
    }
}
