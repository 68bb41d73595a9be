//! One-shot and periodic timers feeding the node's event queue.
//!
//! A timer is a spawned task that sleeps and then pushes a [`TimerFired`]
//! into the worker's channel; it never touches node state itself. Cancelling
//! aborts the task, which stops all future firings, but a firing that was
//! already queued still arrives. Every firing therefore carries the token it
//! was armed with: the node drops tokens whose epoch no longer matches the
//! active context, and contexts compare sequence numbers for slots that get
//! re-armed within one epoch (per-peer deadlines, the master liveness
//! deadline).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::message::NodeId;

/// Which protocol deadline or tick fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Periodic discovery beacon while in the start role.
    HelloTick,
    /// The discovery window closed; decide the election.
    DiscoveryDeadline,
    /// Periodic heartbeat ping in a steady-state role.
    HeartbeatTick,
    /// A tracked peer has been silent for the whole failure window.
    PeerTimeout(NodeId),
    /// The master has been silent for the whole failure window.
    MasterTimeout,
}

/// Schedule-time identity of a firing: the context generation it was armed
/// under, and the handle that armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub epoch: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub token: TimerToken,
    pub kind: TimerKind,
}

/// Scheduler handing out cancellable timers that report back over a channel.
pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    next_seq: u64,
}

impl Timers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, next_seq: 0 }, rx)
    }

    fn token(&mut self, epoch: u64) -> TimerToken {
        self.next_seq += 1;
        TimerToken {
            epoch,
            seq: self.next_seq,
        }
    }

    /// Fires once after `delay`.
    pub fn after(&mut self, delay: Duration, epoch: u64, kind: TimerKind) -> TimerHandle {
        let token = self.token(epoch);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { token, kind });
        });
        TimerHandle {
            token,
            abort: task.abort_handle(),
        }
    }

    /// Fires every `period`, starting immediately.
    pub fn every(&mut self, period: Duration, epoch: u64, kind: TimerKind) -> TimerHandle {
        let token = self.token(epoch);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                if tx
                    .send(TimerFired {
                        token,
                        kind: kind.clone(),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        TimerHandle {
            token,
            abort: task.abort_handle(),
        }
    }
}

/// Owned handle to a scheduled timer.
///
/// Cancelling twice, cancelling after the firing was delivered, or dropping
/// an already-cancelled handle are all no-ops.
#[derive(Debug)]
pub struct TimerHandle {
    token: TimerToken,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn seq(&self) -> u64 {
        self.token.seq
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
