//! Typed FIFO channels bridging host tasks and script-visible values, with
//! N-way select.
//!
//! Channels are hand-rolled on a mutex plus wakeup notifications because the
//! required semantics are specific: capacity 0 is a true rendezvous (a send
//! parks until a receiver is parked), closed channels drain their buffer
//! before receivers observe "closed", a send to a closed channel fails
//! immediately, and closing twice is a distinct domain error.
//!
//! `select` polls its cases and commits one ready case chosen pseudo-
//! uniformly; when none are ready it parks in a bounded exponential-backoff
//! sleep (1 ms doubling to 16 ms) — the portable fallback for multiplexing
//! over channels that have no native N-way primitive. Context cancellation is
//! the implicit extra case: a cancelled context wins without committing any
//! other case and surfaces the canonical cancellation error (the "no case"
//! index of the classic triple maps to the `Err` arm here).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::context::ExecContext;
use crate::error::{EngineError, Result};
use crate::types::ScriptValue;

/// Backoff bounds for the select polling loop.
const SELECT_BACKOFF_FLOOR: Duration = Duration::from_millis(1);
const SELECT_BACKOFF_CEIL: Duration = Duration::from_millis(16);

/// One select alternative.
#[derive(Debug, Clone)]
pub struct SelectCase {
    pub channel: Uuid,
    pub op: SelectOp,
}

#[derive(Debug, Clone)]
pub enum SelectOp {
    Receive,
    Send(ScriptValue),
}

/// The committed case of a select: its index in the input slice, and the
/// received value for receive cases.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectOutcome {
    pub index: usize,
    pub value: Option<ScriptValue>,
}

struct ChanInner {
    buffer: VecDeque<ScriptValue>,
    capacity: usize,
    closed: bool,
    /// Parked receivers on a rendezvous channel; a sender may hand off only
    /// when one is waiting without an item already assigned.
    recv_waiting: usize,
}

impl ChanInner {
    fn can_accept(&self) -> bool {
        if self.capacity == 0 {
            self.recv_waiting > self.buffer.len()
        } else {
            self.buffer.len() < self.capacity
        }
    }
}

struct Channel {
    inner: Mutex<ChanInner>,
    /// Receivers park here; notified on push and on close.
    readable: Notify,
    /// Senders park here; notified on pop, on a receiver arriving at a
    /// rendezvous channel, and on close.
    writable: Notify,
}

impl Channel {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ChanInner {
                buffer: VecDeque::new(),
                capacity,
                closed: false,
                recv_waiting: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }
}

fn closed_error(id: Uuid) -> EngineError {
    EngineError::runtime(format!("channel {id} is closed"))
}

/// Deregisters parked rendezvous receivers when a select exits, on every
/// path. A sender that handed off to a select that left anyway leaves its
/// value buffered for the channel's next receiver.
#[derive(Default)]
struct RecvRegistration {
    channels: Vec<Arc<Channel>>,
}

impl Drop for RecvRegistration {
    fn drop(&mut self) {
        for ch in &self.channels {
            ch.inner.lock().recv_waiting -= 1;
            ch.writable.notify_one();
        }
    }
}

/// Owns all channels; operations address them by id.
pub struct ChannelManager {
    channels: RwLock<HashMap<Uuid, Arc<Channel>>>,
    max_channels: usize,
    closed: AtomicBool,
}

impl ChannelManager {
    pub fn new(max_channels: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            max_channels: max_channels.max(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates a channel. Capacity 0 is a synchronous rendezvous. The cap
    /// counts open channels only; closed ones no longer count against it.
    pub fn create_channel(&self, capacity: usize) -> Result<Uuid> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::closed("channel manager"));
        }
        let mut channels = self.channels.write();
        let active = channels
            .values()
            .filter(|ch| !ch.inner.lock().closed)
            .count();
        if active >= self.max_channels {
            return Err(EngineError::resource(format!(
                "max channels exceeded (cap {})",
                self.max_channels
            )));
        }
        let id = Uuid::new_v4();
        channels.insert(id, Channel::new(capacity));
        debug!(channel = %id, capacity, "created channel");
        Ok(id)
    }

    /// Sends `value`, blocking while the channel is full (or, at capacity 0,
    /// until a receiver is parked) unless `ctx` fires first. Fails
    /// immediately on a closed channel.
    pub async fn send(&self, ctx: &ExecContext, id: Uuid, value: ScriptValue) -> Result<()> {
        let ch = self.lookup(id)?;
        let mut value = Some(value);
        loop {
            let writable = ch.writable.notified();
            {
                let mut inner = ch.inner.lock();
                if inner.closed {
                    return Err(closed_error(id));
                }
                if inner.can_accept() {
                    inner
                        .buffer
                        .push_back(value.take().expect("send value consumed once"));
                    drop(inner);
                    ch.readable.notify_one();
                    return Ok(());
                }
            }
            ctx.run_until(writable).await?;
        }
    }

    /// Receives the oldest value, blocking while the channel is empty unless
    /// `ctx` fires. A closed channel drains its buffer first; only a closed
    /// *and* empty channel reports the closed error.
    pub async fn receive(&self, ctx: &ExecContext, id: Uuid) -> Result<ScriptValue> {
        let ch = self.lookup(id)?;

        // Fast path, and rendezvous registration on the slow path.
        let rendezvous = {
            let mut inner = ch.inner.lock();
            if let Some(v) = inner.buffer.pop_front() {
                drop(inner);
                ch.writable.notify_one();
                return Ok(v);
            }
            if inner.closed {
                return Err(closed_error(id));
            }
            if inner.capacity == 0 {
                inner.recv_waiting += 1;
                true
            } else {
                false
            }
        };
        if rendezvous {
            // A parked sender may now hand off.
            ch.writable.notify_one();
        }

        let outcome = loop {
            let readable = ch.readable.notified();
            {
                let mut inner = ch.inner.lock();
                if let Some(v) = inner.buffer.pop_front() {
                    break Ok(v);
                }
                if inner.closed {
                    break Err(closed_error(id));
                }
            }
            if let Err(e) = ctx.run_until(readable).await {
                break Err(e);
            }
        };

        if rendezvous {
            ch.inner.lock().recv_waiting -= 1;
        }
        ch.writable.notify_one();
        outcome
    }

    /// Waits for one of `cases` to become ready and commits it, choosing
    /// pseudo-uniformly when several are ready at once. A case on a closed
    /// channel counts as ready and surfaces the closed error when committed.
    /// Returns the canonical cancellation/timeout error — committing nothing —
    /// when `ctx` fires first.
    pub async fn select(&self, ctx: &ExecContext, cases: &[SelectCase]) -> Result<SelectOutcome> {
        if cases.is_empty() {
            return Err(EngineError::validation("select requires at least one case"));
        }
        let channels: Vec<Arc<Channel>> = cases
            .iter()
            .map(|c| self.lookup(c.channel))
            .collect::<Result<_>>()?;

        // Receive cases on rendezvous channels must park as receivers, or a
        // sender could never hand off to this select. The guard deregisters
        // on every exit path.
        let mut registration = RecvRegistration::default();
        for (i, case) in cases.iter().enumerate() {
            if matches!(case.op, SelectOp::Receive) {
                let mut inner = channels[i].inner.lock();
                if inner.capacity == 0 && !inner.closed {
                    inner.recv_waiting += 1;
                    registration.channels.push(Arc::clone(&channels[i]));
                }
            }
        }
        for ch in &registration.channels {
            ch.writable.notify_one();
        }

        let mut backoff = SELECT_BACKOFF_FLOOR;
        loop {
            ctx.check()?;

            let mut ready: Vec<usize> = Vec::new();
            for (i, case) in cases.iter().enumerate() {
                let inner = channels[i].inner.lock();
                let is_ready = match case.op {
                    SelectOp::Receive => !inner.buffer.is_empty() || inner.closed,
                    SelectOp::Send(_) => inner.closed || inner.can_accept(),
                };
                if is_ready {
                    ready.push(i);
                }
            }

            if !ready.is_empty() {
                let pick = ready[rand::thread_rng().gen_range(0..ready.len())];
                let ch = &channels[pick];
                let committed = {
                    let mut inner = ch.inner.lock();
                    match &cases[pick].op {
                        SelectOp::Receive => {
                            if let Some(v) = inner.buffer.pop_front() {
                                Some(Ok(SelectOutcome {
                                    index: pick,
                                    value: Some(v),
                                }))
                            } else if inner.closed {
                                Some(Err(closed_error(cases[pick].channel)))
                            } else {
                                None // raced away; rescan
                            }
                        }
                        SelectOp::Send(value) => {
                            if inner.closed {
                                Some(Err(closed_error(cases[pick].channel)))
                            } else if inner.can_accept() {
                                inner.buffer.push_back(value.clone());
                                Some(Ok(SelectOutcome {
                                    index: pick,
                                    value: None,
                                }))
                            } else {
                                None
                            }
                        }
                    }
                };
                match committed {
                    Some(Ok(outcome)) => {
                        match cases[pick].op {
                            SelectOp::Receive => ch.writable.notify_one(),
                            SelectOp::Send(_) => ch.readable.notify_one(),
                        }
                        return Ok(outcome);
                    }
                    Some(Err(e)) => return Err(e),
                    None => continue,
                }
            }

            ctx.run_until(tokio::time::sleep(backoff)).await?;
            backoff = (backoff * 2).min(SELECT_BACKOFF_CEIL);
        }
    }

    /// Closes a channel. Parked senders and receivers wake immediately;
    /// receivers keep draining buffered values first. Closing an already
    /// closed channel is a domain error.
    pub fn close_channel(&self, id: Uuid) -> Result<()> {
        let ch = self.lookup(id)?;
        {
            let mut inner = ch.inner.lock();
            if inner.closed {
                return Err(EngineError::validation(format!(
                    "channel {id} already closed"
                )));
            }
            inner.closed = true;
        }
        ch.readable.notify_waiters();
        ch.writable.notify_waiters();
        debug!(channel = %id, "closed channel");
        Ok(())
    }

    pub fn channel_exists(&self, id: Uuid) -> bool {
        self.channels.read().contains_key(&id)
    }

    pub fn list_channels(&self) -> Vec<Uuid> {
        self.channels.read().keys().copied().collect()
    }

    /// Number of open (not yet closed) channels.
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .values()
            .filter(|ch| !ch.inner.lock().closed)
            .count()
    }

    /// Shuts the manager down: closes every channel, wakes all waiters, and
    /// rejects further creation. Calling again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = self.channels.read();
        for ch in channels.values() {
            ch.inner.lock().closed = true;
            ch.readable.notify_waiters();
            ch.writable.notify_waiters();
        }
    }

    fn lookup(&self, id: Uuid) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("unknown channel {id}")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
