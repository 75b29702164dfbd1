//! Push dispatch: protocol-id-keyed handlers with topic-keyed fan-out.
//!
//! Every frame arriving with serial 0 is handed to the handler registered
//! for its protocol id. For topic-carrying pushes (quotes, order reports)
//! the stock handler built by [`topic_router`] extracts the embedded topic
//! and forwards the remaining payload to the matching subscription's
//! listener. Unsolicited data for an unsubscribed topic is not an error;
//! it is discarded quietly.
//!
//! Subscriptions are desired state, not a one-shot action: the registry
//! keeps every active topic so the channel engine can replay subscribe
//! requests after a reconnect.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::frame::Frame;
use crate::protocol;

/// Listener invoked with the payload of each matching push.
pub type PushListener = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Coarse handler invoked with the body of every push frame carrying its
/// protocol id.
pub type PushHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// One active subscription: which push protocol it targets and where the
/// payloads go.
#[derive(Clone)]
struct Subscription {
    push_protocol_id: u32,
    listener: PushListener,
}

/// Topic-keyed registry of active subscriptions.
pub struct SubscriptionRegistry {
    subs: DashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { subs: DashMap::new() })
    }

    pub fn insert(&self, topic: impl Into<String>, push_protocol_id: u32, listener: PushListener) {
        self.subs.insert(topic.into(), Subscription { push_protocol_id, listener });
    }

    /// Returns whether the topic was registered.
    pub fn remove(&self, topic: &str) -> bool {
        self.subs.remove(topic).is_some()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.subs.contains_key(topic)
    }

    /// Push protocol id a topic is subscribed under, if any.
    pub fn push_protocol_id(&self, topic: &str) -> Option<u32> {
        self.subs.get(topic).map(|s| s.push_protocol_id)
    }

    /// `(topic, push protocol id)` pairs to replay after a reconnect.
    pub fn active(&self) -> Vec<(String, u32)> {
        self.subs
            .iter()
            .map(|e| (e.key().clone(), e.value().push_protocol_id))
            .collect()
    }

    fn deliver(&self, push_protocol_id: u32, topic: &str, payload: Bytes) {
        match self.subs.get(topic) {
            Some(sub) if sub.push_protocol_id == push_protocol_id => {
                (sub.listener)(payload);
            }
            _ => {
                trace!(topic, push_protocol_id, "push for unsubscribed topic discarded");
            }
        }
    }
}

/// Protocol-id-keyed dispatcher for unsolicited frames.
pub struct PushDispatcher {
    handlers: DashMap<u32, PushHandler>,
}

impl PushDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { handlers: DashMap::new() })
    }

    /// Register (or replace) the handler for one push protocol id.
    pub fn register_handler(&self, protocol_id: u32, handler: PushHandler) {
        self.handlers.insert(protocol_id, handler);
    }

    /// Register a handler for `protocol_id` only if none is installed yet.
    /// Lets subscriptions to protocol ids that were never pre-wired get a
    /// route on demand without displacing an existing one.
    pub fn ensure_handler(&self, protocol_id: u32, handler: impl FnOnce() -> PushHandler) {
        self.handlers.entry(protocol_id).or_insert_with(handler);
    }

    /// Route one push frame to its handler, if any.
    pub fn dispatch(&self, frame: &Frame) {
        match self.handlers.get(&frame.protocol_id) {
            Some(handler) => handler(frame.body.clone()),
            None => {
                debug!(protocol_id = frame.protocol_id, "push frame with no handler discarded");
            }
        }
    }
}

/// Stock handler for topic-carrying push protocols: splits the embedded
/// topic off the body and fans the payload out through the registry.
pub fn topic_router(registry: Arc<SubscriptionRegistry>, push_protocol_id: u32) -> PushHandler {
    Arc::new(move |body: Bytes| match protocol::split_topic(&body) {
        Some((topic, payload)) => registry.deliver(push_protocol_id, &topic, payload),
        None => {
            debug!(push_protocol_id, "push body too short to carry a topic; discarded");
        }
    })
}
