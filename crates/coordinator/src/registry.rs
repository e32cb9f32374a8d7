//! Worker Registry (C3): tracks connected workers, assigns IDs, maintains
//! the per-worker state machine, and keeps an idle pool.

use crate::error::{CoordinatorError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// Per-worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connected,
    Registered,
    Idle,
    Busy,
}

/// A connected compute peer: transport halves plus identity, owned
/// exclusively (for mutation of id/clock) by the registry, but shared with
/// the dispatch engine for I/O.
pub struct WorkerHandle {
    id: AtomicU8,
    clock_mhz: AtomicU32,
    pub reader: Mutex<OwnedReadHalf>,
    pub writer: Mutex<OwnedWriteHalf>,
}

impl WorkerHandle {
    fn new(id: u8, reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        Self {
            id: AtomicU8::new(id),
            clock_mhz: AtomicU32::new(0),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub fn id(&self) -> u8 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn clock_mhz(&self) -> u32 {
        self.clock_mhz.load(Ordering::SeqCst)
    }

    fn set_id(&self, id: u8) {
        self.id.store(id, Ordering::SeqCst);
    }

    fn set_clock_mhz(&self, clock_mhz: u32) {
        self.clock_mhz.store(clock_mhz, Ordering::SeqCst);
    }

    /// Build a standalone handle outside the registry, for unit tests of
    /// callers (e.g. the partitioner) that only need transport halves and
    /// an id, not full lifecycle tracking.
    #[cfg(test)]
    pub fn for_test(id: u8, reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        Self::new(id, reader, writer)
    }
}

struct Entry {
    handle: Arc<WorkerHandle>,
    state: WorkerState,
    last_seen: Instant,
}

struct Inner {
    entries: HashMap<u8, Entry>,
    idle_pool: VecDeque<u8>,
    next_provisional_id: u8,
}

/// Shared worker registry. All mutations go through its methods, which
/// take small, non-blocking critical sections (map lookups only, never
/// I/O) under a single async mutex.
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
    idle_notify: Notify,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                idle_pool: VecDeque::new(),
                next_provisional_id: 0,
            }),
            idle_notify: Notify::new(),
        }
    }

    /// Accept a new connection: splits the stream, assigns a provisional
    /// id from the monotonic counter, inserts in CONNECTED state.
    pub async fn add(&self, stream: TcpStream) -> Arc<WorkerHandle> {
        let (reader, writer) = stream.into_split();
        let mut inner = self.inner.lock().await;
        let id = inner.next_provisional_id;
        inner.next_provisional_id = inner.next_provisional_id.wrapping_add(1);

        let handle = Arc::new(WorkerHandle::new(id, reader, writer));
        inner.entries.insert(
            id,
            Entry {
                handle: handle.clone(),
                state: WorkerState::Connected,
                last_seen: Instant::now(),
            },
        );
        handle
    }

    /// After a valid REGISTER handshake: re-key the worker from its
    /// provisional connection id to the hardware-assigned id echoed in the
    /// REGISTER message's header, and record its clock speed.
    pub async fn rekey(&self, old_id: u8, new_id: u8, clock_mhz: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut entry = inner.entries.remove(&old_id).ok_or_else(|| {
            CoordinatorError::ProtocolViolation(format!("unknown worker {old_id}"))
        })?;
        entry.handle.set_id(new_id);
        entry.handle.set_clock_mhz(clock_mhz);
        entry.state = WorkerState::Registered;
        entry.last_seen = Instant::now();
        if inner.entries.insert(new_id, entry).is_some() {
            warn!(worker_id = new_id, "worker id collision on rekey, overwriting previous entry");
        }
        Ok(())
    }

    /// Remove a worker (transport failure, timeout, or SHUTDOWN complete).
    /// Idempotent.
    pub async fn remove(&self, id: u8) {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(&id);
        inner.idle_pool.retain(|&x| x != id);
    }

    /// Transition a worker to DISCONNECTED and remove it: the `any ->
    /// DISCONNECTED` edge on a transport failure, timeout, or protocol
    /// violation. Callers holding an outstanding task call this instead of
    /// `remove` directly so a worker never lingers in a stale BUSY entry
    /// after a failed round trip.
    pub async fn disconnect(&self, id: u8) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.state = WorkerState::Disconnected;
        }
        inner.entries.remove(&id);
        inner.idle_pool.retain(|&x| x != id);
    }

    /// Transition a worker to IDLE and enqueue it onto the idle pool if it
    /// isn't already there.
    pub async fn mark_idle(&self, id: u8) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.state = WorkerState::Idle;
            entry.last_seen = Instant::now();
            if !inner.idle_pool.contains(&id) {
                inner.idle_pool.push_back(id);
            }
        }
        drop(inner);
        self.idle_notify.notify_waiters();
    }

    /// Transition a worker to BUSY (a TASK has been sent).
    pub async fn mark_busy(&self, id: u8) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.state = WorkerState::Busy;
        }
        inner.idle_pool.retain(|&x| x != id);
    }

    /// Ordered (by worker_id ascending) snapshot of every worker eligible
    /// for dispatch — REGISTERED workers become IDLE immediately, so this
    /// returns IDLE/BUSY entries, skipping ones still mid-handshake.
    pub async fn snapshot_workers(&self) -> Vec<Arc<WorkerHandle>> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<u8> = inner
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, WorkerState::Idle | WorkerState::Busy))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| inner.entries[&id].handle.clone())
            .collect()
    }

    async fn idle_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter(|e| e.state == WorkerState::Idle)
            .count()
    }

    /// Block until `n` workers have reached IDLE, or `deadline` elapses.
    pub async fn wait_for_workers(&self, n: usize, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);

            if self.idle_count().await >= n {
                return Ok(());
            }

            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(CoordinatorError::Timeout(format!(
                    "{n} workers to connect"
                )));
            }

            // Bound the wait so a missed wakeup (the usual Notify race)
            // only costs one extra poll, not the whole deadline.
            let tick = remaining.min(Duration::from_millis(200));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Background sweep: remove IDLE workers that haven't been touched
    /// within `liveness_deadline`. BUSY workers are left alone — they are
    /// already being awaited, with their own timeout, by the dispatch
    /// engine.
    pub async fn heartbeat_monitor(self: Arc<Self>, period: Duration, liveness_deadline: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let stale: Vec<u8> = {
                let inner = self.inner.lock().await;
                inner
                    .entries
                    .iter()
                    .filter(|(_, e)| {
                        e.state == WorkerState::Idle && e.last_seen.elapsed() > liveness_deadline
                    })
                    .map(|(id, _)| *id)
                    .collect()
            };
            for id in stale {
                warn!(worker_id = id, "worker missed liveness deadline, removing");
                self.remove(id).await;
            }
        }
    }

    /// Number of workers currently tracked (any state).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

/// Log a one-line registration summary; kept as a free function so the
/// handler can call it without reaching into registry internals.
pub fn log_registered(worker_id: u8, clock_mhz: u32) {
    info!(worker_id, clock_mhz, "worker registered");
}
