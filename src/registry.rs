//! Two small keyed indexes shared by the supervisor and every Agent
//! (spec.md section 4.7): a unique device registry, and a topic-keyed
//! pubsub fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::AgentHandle;
use crate::{Error, Result};

/// `device_id -> (agent handle, host)`. Registration is exclusive: a second
/// `register` for an already-known `device_id` is an error, not a silent
/// replace (spec.md section 4.7) — the caller is expected to deregister the
/// old agent first if a device genuinely came back with a new host.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, (AgentHandle, String)>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&self, device_id: &str, handle: AgentHandle, host: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if inner.contains_key(device_id) {
            return Err(Error::AlreadyRegistered(device_id.to_string()));
        }
        inner.insert(device_id.to_string(), (handle, host.to_string()));
        Ok(())
    }

    pub fn deregister(&self, device_id: &str) {
        self.inner.lock().expect("registry mutex poisoned").remove(device_id);
    }

    pub fn whereis(&self, device_id: &str) -> Option<AgentHandle> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .get(device_id)
            .map(|(handle, _)| handle.clone())
    }

    pub fn host_of(&self, device_id: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .get(device_id)
            .map(|(_, host)| host.clone())
    }

    pub fn device_id_for_host(&self, host: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .iter()
            .find(|(_, (_, h))| h == host)
            .map(|(id, _)| id.clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.lock().expect("registry mutex poisoned").keys().cloned().collect()
    }

    /// Scans every registered Agent for one whose `upnp_session_id` equals
    /// `sid` (spec.md section 4.6's GENA callback dispatch). There's no
    /// secondary index keyed by session id — subscriptions are rare and
    /// per-device, so a linear scan over each Agent's current state is
    /// cheap enough.
    pub async fn whereis_by_upnp_session(&self, sid: &str) -> Option<AgentHandle> {
        let handles: Vec<AgentHandle> = self
            .inner
            .lock()
            .expect("registry mutex poisoned")
            .values()
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in handles {
            if let Ok(state) = handle.whole_state().await {
                if state.upnp_session_id.as_deref() == Some(sid) {
                    return Some(handle);
                }
            }
        }
        None
    }
}

/// Subscriber channel bound; a slow subscriber drops its oldest pending
/// message rather than back-pressuring the publishing Agent (spec.md
/// section 4.7).
const SUBSCRIBER_CAPACITY: usize = 32;

/// `{:update, device_id, diff}`-shaped payload handed to subscribers, named
/// to match what the Agent actually publishes (spec.md section 4.5).
#[derive(Debug, Clone)]
pub struct Update {
    pub device_id: String,
    pub diff: Value,
}

/// Topic-keyed pubsub: repeated subscriptions to the same topic by the same
/// caller are allowed (each gets its own receiver; spec.md section 4.7
/// doesn't dedupe). A subscriber's sender is dropped from the topic's list
/// the next time a publish to that topic finds the receiving end gone.
#[derive(Debug, Clone, Default)]
pub struct PubSub {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Update>>>>>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Update> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.topics
            .lock()
            .expect("pubsub mutex poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Removes every subscriber whose receiver has already been dropped.
    /// Call sites typically do this right after a `publish`, piggybacking
    /// cleanup onto the natural write path instead of running a sweep task.
    pub fn unsubscribe_closed(&self, topic: &str) {
        if let Some(senders) = self.topics.lock().expect("pubsub mutex poisoned").get_mut(topic) {
            senders.retain(|tx| !tx.is_closed());
        }
    }

    pub fn publish(&self, topic: &str, update: Update) {
        let senders = {
            let topics = self.topics.lock().expect("pubsub mutex poisoned");
            match topics.get(topic) {
                Some(s) => s.clone(),
                None => return,
            }
        };
        for tx in &senders {
            match tx.try_send(update.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("dropping oldest pending update for slow subscriber on {topic}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        self.unsubscribe_closed(topic);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let pubsub = PubSub::new();
        pubsub.publish(
            "device:123",
            Update {
                device_id: "123".to_string(),
                diff: Value::Null,
            },
        );
    }

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let pubsub = PubSub::new();
        let mut rx = pubsub.subscribe("device:123");
        pubsub.publish(
            "device:123",
            Update {
                device_id: "123".to_string(),
                diff: serde_json::json!({"volume": 10}),
            },
        );
        let update = rx.recv().await.unwrap();
        assert_eq!(update.device_id, "123");
        assert_eq!(update.diff, serde_json::json!({"volume": 10}));
    }

    #[test]
    fn duplicate_subscribe_is_allowed() {
        let pubsub = PubSub::new();
        let _a = pubsub.subscribe("t");
        let _b = pubsub.subscribe("t");
        assert_eq!(pubsub.topics.lock().unwrap()["t"].len(), 2);
    }
}
