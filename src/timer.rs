//! Cancellable timers driving retransmission and session timeouts.
//!
//! Timers never touch session state themselves: a fire is delivered as an
//! [`Event::TimerFired`] on the engine's event channel, carrying the token
//! the timer was armed with. The engine compares that token against the one
//! recorded on the session, which makes cancellation synchronous with event
//! processing -- a fire that raced its own cancellation arrives with a
//! stale token and is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{Event, SocketId};

pub type TimerToken = u64;

#[derive(Debug)]
pub struct Timers {
    tx: mpsc::Sender<Event>,
    next_token: TimerToken,
    tasks: HashMap<TimerToken, JoinHandle<()>>,
}

impl Timers {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            next_token: 0,
            tasks: HashMap::new(),
        }
    }

    /// Arms a timer that fires once after `delay`.
    pub fn arm_oneshot(
        &mut self,
        peer: SocketAddr,
        socket: SocketId,
        delay: Duration,
    ) -> TimerToken {
        let token = self.alloc();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(Event::TimerFired {
                    peer,
                    socket,
                    token,
                })
                .await;
        });
        self.tasks.insert(token, task);
        token
    }

    /// Arms a timer that fires every `period` until cancelled.
    pub fn arm_periodic(
        &mut self,
        peer: SocketAddr,
        socket: SocketId,
        period: Duration,
    ) -> TimerToken {
        let token = self.alloc();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let fired = Event::TimerFired {
                    peer,
                    socket,
                    token,
                };
                if tx.send(fired).await.is_err() {
                    break;
                }
            }
        });
        self.tasks.insert(token, task);
        token
    }

    /// Cancels an armed timer. Unknown or already-expired tokens are
    /// accepted silently, which keeps session cleanup idempotent.
    pub fn cancel(&mut self, token: TimerToken) {
        if let Some(task) = self.tasks.remove(&token) {
            task.abort();
        }
    }

    /// Drops bookkeeping for one-shot timers that have already fired.
    pub fn reap_finished(&mut self) {
        self.tasks.retain(|_, task| !task.is_finished());
    }

    fn alloc(&mut self) -> TimerToken {
        let token = self.next_token;
        self.next_token += 1;
        token
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}
