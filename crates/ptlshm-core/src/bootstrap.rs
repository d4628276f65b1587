//! Rank discovery over the raw interface
//!
//! A two-phase collective. In the gather phase every contributor puts its
//! own address into slot `rank` of the collector's landing buffer. Once all
//! contributions have arrived, the collector puts the assembled table into
//! every contributor's pre-posted broadcast buffer. Receive buffers are
//! always posted before any put can target them.
//!
//! Any counter failure aborts the run for that participant only; peers
//! waiting on its contribution stall unless a wait timeout is configured.

use crate::ni::{AckRequest, CompletionCounter, RawInterface, RecvOptions, SendOptions};
use crate::params::{parse_var, ENV_NUM_PROCS, ENV_RANK};
use crate::process_id::{ProcessId, ADDRESS_SIZE};
use crate::table::AddressTable;
use crate::{Error, Result};
use std::time::Duration;

/// Who takes part in a bootstrap run and where the collector lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Number of ranks N
    pub size: usize,
    /// This participant's rank
    pub rank: usize,
    /// Address of the collector on the raw interface
    pub collector: ProcessId,
    /// Upper bound on each completion wait; `None` waits forever
    pub wait_timeout: Option<Duration>,
}

impl BootstrapConfig {
    pub fn new(size: usize, rank: usize, collector: ProcessId) -> Result<Self> {
        if size == 0 {
            return Err(Error::Configuration("bootstrap group is empty".to_string()));
        }
        if rank >= size {
            return Err(Error::Configuration(format!(
                "rank {} out of range for {} ranks",
                rank, size
            )));
        }
        Ok(Self {
            size,
            rank,
            collector,
            wait_timeout: None,
        })
    }

    /// Group size, rank and collector address from the launch environment
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let size = parse_var(&lookup, ENV_NUM_PROCS)?;
        let rank = parse_var(&lookup, ENV_RANK)?;
        Self::new(size, rank, ProcessId::collector_from_env()?)
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

/// Run the bootstrap as a rank of the group
///
/// Takes the collector role if `ni` is the collector. The raw interface is
/// closed on every path; on failure no table is returned.
pub fn bootstrap<I: RawInterface>(ni: I, config: &BootstrapConfig) -> Result<AddressTable> {
    let me = ni.id();
    let result = if me == config.collector {
        tracing::debug!(rank = config.rank, size = config.size, %me, "bootstrap as collector");
        run_collector(&ni, config)
    } else {
        tracing::debug!(rank = config.rank, size = config.size, %me, "bootstrap as contributor");
        run_contributor(&ni, config)
    };
    finish(ni, result)
}

/// Run the collector on behalf of a group it does not belong to
///
/// This is the launcher's side: all `size` ranks contribute, and all of
/// them receive the table.
pub fn collect_and_distribute<I: RawInterface>(
    ni: I,
    size: usize,
    wait_timeout: Option<Duration>,
) -> Result<AddressTable> {
    if size == 0 {
        return finish(ni, Err(Error::Configuration("bootstrap group is empty".to_string())));
    }
    tracing::debug!(size, me = %ni.id(), "bootstrap as dedicated collector");
    let result = gather(&ni, AddressTable::blank_bytes(size), size as u64, wait_timeout)
        .and_then(|bytes| AddressTable::from_bytes(size, &bytes))
        .and_then(|table| {
            broadcast(&ni, &table, None, wait_timeout)?;
            Ok(table)
        });
    finish(ni, result)
}

fn finish<I: RawInterface>(ni: I, result: Result<AddressTable>) -> Result<AddressTable> {
    let closed = ni.fini();
    match (result, closed) {
        (Ok(table), Ok(())) => Ok(table),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                tracing::warn!(error = %close_err, "failed to close raw interface");
            }
            tracing::warn!(error = %err, "bootstrap aborted");
            Err(err)
        }
    }
}

fn run_collector<I: RawInterface>(ni: &I, config: &BootstrapConfig) -> Result<AddressTable> {
    let me = ni.id();
    let mut landing = AddressTable::blank_bytes(config.size);
    // our own slot needs no network round trip
    AddressTable::write_slot(&mut landing, config.rank, me)?;

    let contributors = (config.size - 1) as u64;
    let gathered = gather(ni, landing, contributors, config.wait_timeout)?;
    let table = AddressTable::from_bytes(config.size, &gathered)?;
    if table.get(config.rank) != Some(me) {
        return Err(Error::BootstrapFailure(format!(
            "collector slot {} was overwritten",
            config.rank
        )));
    }

    broadcast(ni, &table, Some(config.rank), config.wait_timeout)?;
    Ok(table)
}

fn run_contributor<I: RawInterface>(ni: &I, config: &BootstrapConfig) -> Result<AddressTable> {
    let table = with_counter(ni, |table_ct| {
        // post the broadcast buffer before our address can reach the collector
        let recv = ni.append_receive(
            AddressTable::blank_bytes(config.size),
            RecvOptions::OP_PUT | RecvOptions::USE_ONCE | RecvOptions::COUNT_PUT,
            table_ct,
        )?;
        let exchanged = send_address(ni, config).and_then(|_| {
            tracing::trace!(rank = config.rank, "waiting for address table");
            await_counter(table_ct, 1, config.wait_timeout, "table broadcast")
        });
        let bytes = ni.unlink_receive(recv);
        exchanged?;
        AddressTable::from_bytes(config.size, &bytes?)
    })?;

    if table.get(config.rank) != Some(ni.id()) {
        return Err(Error::BootstrapFailure(format!(
            "table lists {:?} for rank {}, expected {}",
            table.get(config.rank),
            config.rank,
            ni.id()
        )));
    }
    Ok(table)
}

fn send_address<I: RawInterface>(ni: &I, config: &BootstrapConfig) -> Result<()> {
    with_counter(ni, |send_ct| {
        let send = ni.bind_send(
            ni.id().to_bytes().to_vec(),
            SendOptions::COUNT_ACK | SendOptions::EVENT_DISABLE,
            send_ct,
        )?;
        let sent = ni
            .put(
                &send,
                0,
                ADDRESS_SIZE,
                AckRequest::Counter,
                config.collector,
                config.rank * ADDRESS_SIZE,
            )
            .and_then(|_| await_counter(send_ct, 1, config.wait_timeout, "address send"));
        let released = ni.release_send(send);
        sent?;
        released
    })
}

/// Post `landing` and wait for `expected` puts into it
fn gather<I: RawInterface>(
    ni: &I,
    landing: Vec<u8>,
    expected: u64,
    wait_timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    with_counter(ni, |landing_ct| {
        let recv = ni.append_receive(
            landing,
            RecvOptions::OP_PUT
                | RecvOptions::OP_GET
                | RecvOptions::COUNT_PUT
                | RecvOptions::COUNT_GET,
            landing_ct,
        )?;
        tracing::trace!(expected, "landing buffer posted");
        let waited = await_counter(landing_ct, expected, wait_timeout, "gather");
        let bytes = ni.unlink_receive(recv);
        waited?;

        let arrived = landing_ct.get().success;
        if arrived != expected {
            return Err(Error::BootstrapFailure(format!(
                "gather expected {} contributions, got {}",
                expected, arrived
            )));
        }
        tracing::debug!(arrived, "gather complete");
        bytes
    })
}

/// Put the whole table into the broadcast buffer of every rank but `skip`
fn broadcast<I: RawInterface>(
    ni: &I,
    table: &AddressTable,
    skip: Option<usize>,
    wait_timeout: Option<Duration>,
) -> Result<()> {
    let targets: Vec<ProcessId> = table
        .iter()
        .enumerate()
        .filter(|(rank, _)| Some(*rank) != skip)
        .map(|(_, id)| id)
        .collect();
    let bytes = table.to_bytes();
    let len = bytes.len();

    with_counter(ni, |bcast_ct| {
        let send = ni.bind_send(
            bytes,
            SendOptions::COUNT_ACK | SendOptions::EVENT_DISABLE,
            bcast_ct,
        )?;
        let sent = targets
            .iter()
            .try_for_each(|&target| ni.put(&send, 0, len, AckRequest::Counter, target, 0))
            .and_then(|_| {
                await_counter(bcast_ct, targets.len() as u64, wait_timeout, "broadcast")
            });
        let released = ni.release_send(send);
        sent?;
        tracing::debug!(targets = targets.len(), "broadcast complete");
        released
    })
}

/// Allocate a counter for the duration of `f` and free it on every path
fn with_counter<I, T, F>(ni: &I, f: F) -> Result<T>
where
    I: RawInterface,
    F: FnOnce(&I::Counter) -> Result<T>,
{
    let counter = ni.counter_alloc()?;
    let result = f(&counter);
    let freed = ni.counter_free(counter);
    let value = result?;
    freed?;
    Ok(value)
}

fn await_counter<C: CompletionCounter>(
    counter: &C,
    threshold: u64,
    wait_timeout: Option<Duration>,
    what: &str,
) -> Result<()> {
    let event = match wait_timeout {
        Some(timeout) => counter
            .wait_timeout(threshold, timeout)
            .ok_or(Error::Timeout(timeout))?,
        None => counter.wait(threshold),
    };
    if event.failed() {
        return Err(Error::BootstrapFailure(format!(
            "{}: {} of {} completed, {} failed",
            what, event.success, threshold, event.failure
        )));
    }
    Ok(())
}
