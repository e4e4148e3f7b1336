//! Subscription registry.
//!
//! Each distinct pattern owns one server-side sid. Any number of local sinks can
//! share that sid; a `MSG` is fanned out to all of them with non-blocking sends.
//! The registry survives reconnects: [`Registry::replay`] re-issues every live `SUB`
//! on a fresh connection.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vaultlink_core::{ClientFrame, MessageFrame, Subject};

use crate::outbound::Outbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subject: Subject,
    pub reply_to: Option<Subject>,
    pub payload: Bytes,
}

impl Delivery {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// A subscription with its own delivery channel.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    pattern: Subject,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &Subject {
        &self.pattern
    }

    /// Next delivery. `None` once the subscription is removed or the client closes.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

struct Sink {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct PatternEntry {
    pattern: Subject,
    sinks: Vec<Sink>,
}

#[derive(Default)]
struct Inner {
    next_sid: u64,
    next_id: u64,
    by_sid: BTreeMap<u64, PatternEntry>,
    by_pattern: HashMap<Subject, u64>,
    owners: HashMap<SubscriptionId, u64>,
    online: bool,
}

impl Inner {
    fn remove_entry(&mut self, sid: u64) -> Option<ClientFrame> {
        let entry = self.by_sid.remove(&sid)?;
        self.by_pattern.remove(&entry.pattern);
        for sink in &entry.sinks {
            self.owners.remove(&sink.id);
        }
        self.online.then_some(ClientFrame::Unsub {
            sid,
            max_msgs: None,
        })
    }
}

pub struct Registry {
    inner: Mutex<Inner>,
    outbound: Outbound,
}

impl Registry {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            outbound,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, frame: ClientFrame) {
        if self.outbound.send(frame).is_err() {
            debug!("writer gone, dropping subscription frame");
        }
    }

    /// Subscribe with a fresh channel.
    pub fn subscribe(&self, pattern: Subject) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.subscribe_with(pattern.clone(), tx);
        Subscription {
            id,
            pattern,
            receiver,
        }
    }

    /// Subscribe a caller-owned sink. Registering the same channel for the same
    /// pattern again returns the existing id.
    pub fn subscribe_with(
        &self,
        pattern: Subject,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> SubscriptionId {
        let mut guard = self.lock();
        let inner = &mut *guard;

        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);

        if let Some(&sid) = inner.by_pattern.get(&pattern) {
            if let Some(entry) = inner.by_sid.get_mut(&sid) {
                if let Some(existing) = entry.sinks.iter().find(|s| s.tx.same_channel(&tx)) {
                    return existing.id;
                }
                entry.sinks.push(Sink { id, tx });
                inner.owners.insert(id, sid);
                return id;
            }
        }

        inner.next_sid += 1;
        let sid = inner.next_sid;
        inner.by_sid.insert(
            sid,
            PatternEntry {
                pattern: pattern.clone(),
                sinks: vec![Sink { id, tx }],
            },
        );
        inner.by_pattern.insert(pattern.clone(), sid);
        inner.owners.insert(id, sid);
        debug!("subscribed {} as sid {}", pattern, sid);

        if inner.online {
            self.emit(ClientFrame::Sub {
                subject: pattern,
                sid,
            });
        }
        id
    }

    /// Remove one sink. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(sid) = inner.owners.remove(&id) else {
            return false;
        };
        let now_empty = match inner.by_sid.get_mut(&sid) {
            Some(entry) => {
                entry.sinks.retain(|s| s.id != id);
                entry.sinks.is_empty()
            }
            None => false,
        };
        if now_empty {
            debug!("last sink left sid {}", sid);
            if let Some(frame) = inner.remove_entry(sid) {
                self.emit(frame);
            }
        }
        true
    }

    /// Fan a `MSG` out to the sinks of its sid. Returns the number of sinks reached.
    pub fn dispatch(&self, msg: MessageFrame) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(entry) = inner.by_sid.get_mut(&msg.sid) else {
            debug!("dropping message on {} for unknown sid {}", msg.subject, msg.sid);
            return 0;
        };
        if !entry.pattern.matches(msg.subject.as_str()) {
            warn!(
                "dropping message on {}: does not match sid {} pattern {}",
                msg.subject, msg.sid, entry.pattern
            );
            return 0;
        }

        let delivery = Delivery {
            subject: msg.subject,
            reply_to: msg.reply_to,
            payload: msg.payload,
        };
        let mut delivered = 0;
        let mut pruned = Vec::new();
        entry.sinks.retain(|sink| {
            if sink.tx.send(delivery.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                pruned.push(sink.id);
                false
            }
        });
        let now_empty = entry.sinks.is_empty();

        for id in pruned {
            debug!("pruned closed sink {} from sid {}", id, msg.sid);
            inner.owners.remove(&id);
        }
        if now_empty {
            if let Some(frame) = inner.remove_entry(msg.sid) {
                self.emit(frame);
            }
        }
        delivered
    }

    /// `SUB` frames for every live pattern in registration order. Marks the registry
    /// online so later changes are emitted directly.
    pub fn replay(&self) -> Vec<ClientFrame> {
        let mut inner = self.lock();
        inner.online = true;
        inner
            .by_sid
            .iter()
            .map(|(sid, entry)| ClientFrame::Sub {
                subject: entry.pattern.clone(),
                sid: *sid,
            })
            .collect()
    }

    pub fn set_offline(&self) {
        self.lock().online = false;
    }

    /// Drop every subscription. Receivers observe the end of their stream.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.by_sid.clear();
        inner.by_pattern.clear();
        inner.owners.clear();
        inner.online = false;
    }

    /// Number of distinct patterns.
    pub fn len(&self) -> usize {
        self.lock().by_sid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn subject(s: &str) -> Subject {
        Subject::parse(s).unwrap()
    }

    fn msg(subject_str: &str, sid: u64, payload: &'static [u8]) -> MessageFrame {
        MessageFrame {
            subject: subject(subject_str),
            sid,
            reply_to: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_offline_subscribe_is_replayed_in_order() {
        let (outbound, mut rx) = Outbound::channel();
        let registry = Registry::new(outbound);

        registry.subscribe(subject("app.forApp.a"));
        registry.subscribe(subject("app.forApp.b.*"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let frames = registry.replay();
        assert_eq!(
            frames,
            vec![
                ClientFrame::Sub {
                    subject: subject("app.forApp.a"),
                    sid: 1
                },
                ClientFrame::Sub {
                    subject: subject("app.forApp.b.*"),
                    sid: 2
                },
            ]
        );

        registry.subscribe(subject("app.forApp.c"));
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientFrame::Sub { sid: 3, .. })
        ));
    }

    #[test]
    fn test_same_channel_is_idempotent() {
        let (outbound, _rx) = Outbound::channel();
        let registry = Registry::new(outbound);
        let (tx, mut deliveries) = mpsc::unbounded_channel();

        let first = registry.subscribe_with(subject("app.forApp.>"), tx.clone());
        let second = registry.subscribe_with(subject("app.forApp.>"), tx);
        assert_eq!(first, second);

        registry.replay();
        assert_eq!(registry.dispatch(msg("app.forApp.x.y", 1, b"1")), 1);
        assert!(deliveries.try_recv().is_ok());
        assert!(deliveries.try_recv().is_err());
    }

    #[test]
    fn test_closed_sink_is_pruned_without_affecting_others() {
        let (outbound, mut rx) = Outbound::channel();
        let registry = Registry::new(outbound);
        registry.replay();

        let dropped = registry.subscribe(subject("app.forApp.note"));
        let mut kept = registry.subscribe(subject("app.forApp.note"));
        assert!(matches!(rx.try_recv(), Ok(ClientFrame::Sub { sid: 1, .. })));
        drop(dropped);

        assert_eq!(registry.dispatch(msg("app.forApp.note", 1, b"hi")), 1);
        assert_eq!(kept.try_recv().unwrap().payload, Bytes::from_static(b"hi"));

        drop(kept);
        assert_eq!(registry.dispatch(msg("app.forApp.note", 1, b"again")), 0);
        assert!(registry.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientFrame::Unsub { sid: 1, max_msgs: None })
        ));
    }

    #[test]
    fn test_dispatch_checks_pattern_and_sid() {
        let (outbound, _rx) = Outbound::channel();
        let registry = Registry::new(outbound);
        let mut sub = registry.subscribe(subject("app.forApp.*"));

        assert_eq!(registry.dispatch(msg("app.forApp.a.b", 1, b"x")), 0);
        assert_eq!(registry.dispatch(msg("app.forApp.a", 9, b"x")), 0);
        assert!(sub.try_recv().is_none());
        assert_eq!(registry.dispatch(msg("app.forApp.a", 1, b"x")), 1);
        assert!(sub.try_recv().is_some());
    }

    #[test]
    fn test_unsubscribe_last_sink_emits_unsub() {
        let (outbound, mut rx) = Outbound::channel();
        let registry = Registry::new(outbound);
        registry.replay();

        let a = registry.subscribe(subject("app.forApp.a"));
        let b = registry.subscribe(subject("app.forApp.a"));
        assert!(matches!(rx.try_recv(), Ok(ClientFrame::Sub { .. })));

        assert!(registry.unsubscribe(a.id()));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(registry.unsubscribe(b.id()));
        assert!(matches!(rx.try_recv(), Ok(ClientFrame::Unsub { sid: 1, .. })));
        assert!(!registry.unsubscribe(b.id()));
    }

    #[tokio::test]
    async fn test_clear_ends_streams() {
        let (outbound, _rx) = Outbound::channel();
        let registry = Registry::new(outbound);
        let mut sub = registry.subscribe(subject("app.forApp.a"));
        registry.clear();
        assert!(sub.recv().await.is_none());
    }
}
