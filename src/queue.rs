//! Process-local FIFO of provider ids, drained by a single worker.
//!
//! All queue state lives inside the worker task. Callers talk to it through
//! a command channel, so `enqueue` and the drain step can never interleave
//! and at most one attempt is in flight.

use async_trait::async_trait;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Runs one full scrape attempt (including retries) for a provider.
#[async_trait]
pub trait AttemptRunner: Send + Sync + 'static {
    async fn run_attempt(&self, provider_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub provider_id: String,
    /// False when the provider was already queued or in flight.
    pub queued: bool,
    /// Place in line; the in-flight entry is 0.
    pub position: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub in_flight: Option<String>,
    pub queued: Vec<String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("scrape queue worker is not running")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    in_flight: Option<String>,
}

impl QueueState {
    fn position_of(&self, provider_id: &str) -> Option<usize> {
        if self.in_flight.as_deref() == Some(provider_id) {
            return Some(0);
        }
        let offset = usize::from(self.in_flight.is_some());
        self.pending
            .iter()
            .position(|queued| queued == provider_id)
            .map(|index| index + offset)
    }

    fn enqueue(&mut self, provider_id: String) -> EnqueueOutcome {
        if let Some(position) = self.position_of(&provider_id) {
            return EnqueueOutcome {
                provider_id,
                queued: false,
                position,
            };
        }
        self.pending.push_back(provider_id.clone());
        let position = self
            .position_of(&provider_id)
            .unwrap_or(self.pending.len());
        EnqueueOutcome {
            provider_id,
            queued: true,
            position,
        }
    }

    /// Pops the head when nothing is in flight.
    fn start_next(&mut self) -> Option<String> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.in_flight = Some(next.clone());
        Some(next)
    }

    fn finish(&mut self, provider_id: &str) {
        if self.in_flight.as_deref() == Some(provider_id) {
            self.in_flight = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            in_flight: self.in_flight.clone(),
            queued: self.pending.iter().cloned().collect(),
        }
    }

    fn depth(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }
}

enum Command {
    Enqueue {
        provider_id: String,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

#[derive(Clone)]
pub struct ScrapeQueue {
    tx: mpsc::Sender<Command>,
}

impl ScrapeQueue {
    /// Starts the worker. It keeps draining after every handle is dropped and
    /// exits once the queue is empty.
    pub fn spawn(runner: Arc<dyn AttemptRunner>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity_from_env());
        let handle = tokio::spawn(drain_loop(runner, rx));
        (Self { tx }, handle)
    }

    pub async fn enqueue(&self, provider_id: impl Into<String>) -> Result<EnqueueOutcome, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                provider_id: provider_id.into(),
                reply,
            })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }
}

async fn drain_loop(runner: Arc<dyn AttemptRunner>, mut commands: mpsc::Receiver<Command>) {
    let mut state = QueueState::default();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

    loop {
        launch_next(&mut state, &runner, &done_tx);
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Enqueue { provider_id, reply }) => {
                    let outcome = state.enqueue(provider_id);
                    if outcome.queued {
                        info!(target: "scrape.queue", provider_id = %outcome.provider_id, position = outcome.position, "provider queued");
                    } else {
                        debug!(target: "scrape.queue", provider_id = %outcome.provider_id, "provider already queued, ignoring");
                    }
                    crate::metrics::queue_depth(state.depth());
                    let _ = reply.send(outcome);
                }
                Some(Command::Snapshot { reply }) => {
                    let _ = reply.send(state.snapshot());
                }
                None => break,
            },
            Some(finished) = done_rx.recv() => {
                state.finish(&finished);
                crate::metrics::queue_depth(state.depth());
            }
        }
    }

    debug!(target: "scrape.queue", remaining = state.depth(), "queue closed, draining");
    while !state.is_idle() {
        launch_next(&mut state, &runner, &done_tx);
        match done_rx.recv().await {
            Some(finished) => state.finish(&finished),
            None => break,
        }
    }
    info!(target: "scrape.queue", "queue worker stopped");
}

fn launch_next(
    state: &mut QueueState,
    runner: &Arc<dyn AttemptRunner>,
    done: &mpsc::UnboundedSender<String>,
) {
    let Some(provider_id) = state.start_next() else {
        return;
    };
    info!(target: "scrape.queue", provider_id = %provider_id, "starting scrape attempt");
    let runner = runner.clone();
    let done = done.clone();
    tokio::spawn(async move {
        let attempt = {
            let runner = runner.clone();
            let provider_id = provider_id.clone();
            tokio::spawn(async move { runner.run_attempt(&provider_id).await })
        };
        if let Err(err) = attempt.await {
            error!(target: "scrape.queue", provider_id = %provider_id, error = %err, "scrape attempt aborted");
        }
        let _ = done.send(provider_id);
    });
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
