//! In-process signaling store.
//!
//! Behaves like a document store with a change feed: envelopes sit in a
//! per-recipient queue until acknowledged, rosters are pushed in full on
//! every change, and the whole store can be switched offline to exercise
//! the `SignalingUnavailable` paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    CallDocument, PresenceRecord, Receipt, SignalEnvelope, SignalStore, SignedDescription,
    StoreEvent, StoreSender, Subscription,
};
use crate::error::StoreError;
use crate::utils::random_id;

type QueueKey = (String, String);

struct Sub {
    key: SubKey,
    tx: StoreSender,
}

#[derive(Clone, PartialEq, Eq)]
enum SubKey {
    Incoming { room: String, peer_id: String },
    Presence { room: String },
    Call { call_id: String },
}

#[derive(Default)]
struct Inner {
    available: bool,
    next_ts: u64,
    next_receipt: u64,
    next_sub: u64,
    queues: HashMap<QueueKey, VecDeque<(Receipt, SignalEnvelope)>>,
    presence: HashMap<String, BTreeMap<String, PresenceRecord>>,
    calls: HashMap<String, CallDocument>,
    subs: HashMap<u64, Sub>,
    history: Vec<SignalEnvelope>,
}

impl Inner {
    fn check(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    fn add_sub(&mut self, key: SubKey, tx: StoreSender) -> u64 {
        self.next_sub += 1;
        let id = self.next_sub;
        self.subs.insert(id, Sub { key, tx });
        id
    }

    /// Sends to every subscriber matching `key`, pruning closed channels.
    fn notify(&mut self, key: &SubKey, event: StoreEvent) {
        self.subs.retain(|_, sub| {
            if &sub.key != key {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    fn roster(&self, room: &str) -> Vec<PresenceRecord> {
        let mut roster: Vec<PresenceRecord> = self
            .presence
            .get(room)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        roster.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        roster
    }
}

/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the store offline (or back online), notifying every subscriber.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.lock();
        if inner.available == available {
            return;
        }
        inner.available = available;
        let event = if available {
            StoreEvent::Restored
        } else {
            StoreEvent::Unavailable("memory store is offline".into())
        };
        log::info!("Memory store availability -> {}", available);
        inner.subs.retain(|_, sub| sub.tx.send(event.clone()).is_ok());
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    /// Every envelope ever published, in publish order.
    pub fn published(&self) -> Vec<SignalEnvelope> {
        self.lock().history.clone()
    }

    /// Envelopes waiting for `peer_id` that have not been acknowledged.
    pub fn pending_for(&self, room: &str, peer_id: &str) -> usize {
        self.lock()
            .queues
            .get(&(room.to_string(), peer_id.to_string()))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn roster(&self, room: &str) -> Vec<PresenceRecord> {
        self.lock().roster(room)
    }

    pub fn call_exists(&self, call_id: &str) -> bool {
        self.lock().calls.contains_key(call_id)
    }

    fn unsubscriber(&self, id: u64) -> Subscription {
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subs
                    .remove(&id);
            }
        })
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn publish(&self, room: &str, mut envelope: SignalEnvelope) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;

        inner.next_ts += 1;
        envelope.ts = inner.next_ts;
        inner.next_receipt += 1;
        let receipt = Receipt(inner.next_receipt);

        let key = (room.to_string(), envelope.to.clone());
        inner
            .queues
            .entry(key)
            .or_default()
            .push_back((receipt.clone(), envelope.clone()));
        inner.history.push(envelope.clone());

        let sub_key = SubKey::Incoming {
            room: room.to_string(),
            peer_id: envelope.to.clone(),
        };
        inner.notify(&sub_key, StoreEvent::Incoming { envelope, receipt });
        Ok(())
    }

    async fn acknowledge(&self, room: &str, receipt: &Receipt) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        for ((queue_room, _), queue) in inner.queues.iter_mut() {
            if queue_room == room {
                queue.retain(|(r, _)| r != receipt);
            }
        }
        Ok(())
    }

    async fn clear_inbox(&self, room: &str, peer_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        if let Some(queue) = inner.queues.remove(&(room.to_string(), peer_id.to_string())) {
            log::debug!("Cleared {} stale envelope(s) for {} in {}", queue.len(), peer_id, room);
        }
        Ok(())
    }

    async fn subscribe_incoming(
        &self,
        room: &str,
        self_id: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError> {
        let id = {
            let mut inner = self.lock();
            inner.check()?;
            let backlog: Vec<(Receipt, SignalEnvelope)> = inner
                .queues
                .get(&(room.to_string(), self_id.to_string()))
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default();
            for (receipt, envelope) in backlog {
                let _ = events.send(StoreEvent::Incoming { envelope, receipt });
            }
            inner.add_sub(
                SubKey::Incoming {
                    room: room.to_string(),
                    peer_id: self_id.to_string(),
                },
                events,
            )
        };
        Ok(self.unsubscriber(id))
    }

    async fn subscribe_presence(
        &self,
        room: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError> {
        let id = {
            let mut inner = self.lock();
            inner.check()?;
            let _ = events.send(StoreEvent::Roster(inner.roster(room)));
            inner.add_sub(
                SubKey::Presence {
                    room: room.to_string(),
                },
                events,
            )
        };
        Ok(self.unsubscriber(id))
    }

    async fn put_presence(&self, room: &str, record: PresenceRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        inner
            .presence
            .entry(room.to_string())
            .or_default()
            .insert(record.peer_id.clone(), record);
        let roster = inner.roster(room);
        inner.notify(
            &SubKey::Presence {
                room: room.to_string(),
            },
            StoreEvent::Roster(roster),
        );
        Ok(())
    }

    async fn remove_presence(&self, room: &str, peer_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        let removed = inner
            .presence
            .get_mut(room)
            .and_then(|m| m.remove(peer_id))
            .is_some();
        if removed {
            let roster = inner.roster(room);
            inner.notify(
                &SubKey::Presence {
                    room: room.to_string(),
                },
                StoreEvent::Roster(roster),
            );
        }
        Ok(())
    }

    async fn create_call(&self, document: CallDocument) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        let call_id = random_id();
        inner.calls.insert(call_id.clone(), document);
        Ok(call_id)
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallDocument>, StoreError> {
        let inner = self.lock();
        inner.check()?;
        Ok(inner.calls.get(call_id).cloned())
    }

    async fn set_call_answer(
        &self,
        call_id: &str,
        answer: SignedDescription,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        let document = match inner.calls.get_mut(call_id) {
            Some(doc) => {
                doc.answer = Some(answer);
                doc.clone()
            }
            None => return Err(StoreError::NotFound(call_id.to_string())),
        };
        inner.notify(
            &SubKey::Call {
                call_id: call_id.to_string(),
            },
            StoreEvent::CallUpdated {
                call_id: call_id.to_string(),
                document: Some(document),
            },
        );
        Ok(())
    }

    async fn delete_call(&self, call_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check()?;
        if inner.calls.remove(call_id).is_some() {
            inner.queues.retain(|(room, _), _| room != call_id);
            inner.notify(
                &SubKey::Call {
                    call_id: call_id.to_string(),
                },
                StoreEvent::CallUpdated {
                    call_id: call_id.to_string(),
                    document: None,
                },
            );
        }
        Ok(())
    }

    async fn watch_call(
        &self,
        call_id: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError> {
        let id = {
            let mut inner = self.lock();
            inner.check()?;
            let document = inner.calls.get(call_id).cloned();
            let _ = events.send(StoreEvent::CallUpdated {
                call_id: call_id.to_string(),
                document,
            });
            inner.add_sub(
                SubKey::Call {
                    call_id: call_id.to_string(),
                },
                events,
            )
        };
        Ok(self.unsubscriber(id))
    }
}
