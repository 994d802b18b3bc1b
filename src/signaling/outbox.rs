//! Ordered publisher.
//!
//! One task per session drains a FIFO of envelopes and publishes each with
//! retry/backoff before touching the next, so per-pair publish order is
//! the submission order. Permanent failures are reported back to the
//! session loop instead of being dropped silently.
//!
//! Sequence numbers only ever grow per recipient, even across a departure,
//! so a returning peer never mistakes a new offer for a redelivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{SignalEnvelope, SignalStore};
use crate::config::RetryPolicy;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxReport {
    Published { to: String },
    Failed { to: String, error: StoreError },
}

/// Per-recipient sequence at or below which queued envelopes are skipped.
type Cutoffs = Arc<Mutex<HashMap<String, u64>>>;

fn is_discarded(cutoffs: &Cutoffs, envelope: &SignalEnvelope) -> bool {
    cutoffs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&envelope.to)
        .is_some_and(|cutoff| envelope.sequence <= *cutoff)
}

pub struct Outbox {
    tx: mpsc::UnboundedSender<SignalEnvelope>,
    sequences: HashMap<String, u64>,
    cutoffs: Cutoffs,
    task: JoinHandle<()>,
}

impl Outbox {
    pub fn spawn(
        store: Arc<dyn SignalStore>,
        room: String,
        policy: RetryPolicy,
        reports: mpsc::UnboundedSender<OutboxReport>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let cutoffs = Cutoffs::default();
        let skip = cutoffs.clone();
        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if is_discarded(&skip, &envelope) {
                    log::debug!("Discarding queued {:?} to {}", envelope.kind, envelope.to);
                    continue;
                }
                let to = envelope.to.clone();
                let sequence = envelope.sequence;
                let report = match publish_with_retry(store.as_ref(), &room, envelope, policy).await {
                    Ok(()) => OutboxReport::Published { to },
                    Err(error) => {
                        let stale = skip
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get(&to)
                            .is_some_and(|cutoff| sequence <= *cutoff);
                        if stale {
                            continue;
                        }
                        log::warn!("Giving up publishing to {} in {}: {}", to, room, error);
                        OutboxReport::Failed { to, error }
                    }
                };
                if reports.send(report).is_err() {
                    break;
                }
            }
        });
        Self {
            tx,
            sequences: HashMap::new(),
            cutoffs,
            task,
        }
    }

    /// Stamps the next per-recipient sequence number and queues the envelope.
    pub fn send(&mut self, mut envelope: SignalEnvelope) -> bool {
        let seq = self.sequences.entry(envelope.to.clone()).or_insert(0);
        *seq += 1;
        envelope.sequence = *seq;
        self.tx.send(envelope).is_ok()
    }

    /// Skips everything queued so far for `to`; later sends go out as usual.
    /// A failure of a skipped envelope is not reported.
    pub fn discard_queued(&mut self, to: &str) {
        let cutoff = self.sequences.get(to).copied().unwrap_or(0);
        self.cutoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(to.to_string(), cutoff);
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Publishes once, retrying transient failures per `policy`.
pub async fn publish_with_retry(
    store: &dyn SignalStore,
    room: &str,
    envelope: SignalEnvelope,
    policy: RetryPolicy,
) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        match store.publish(room, envelope.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                log::debug!(
                    "Publish {:?} to {} failed (attempt {}): {}; retrying in {:?}",
                    envelope.kind,
                    envelope.to,
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
