//! Event bus
//!
//! Typed topics on a flat dotted namespace. Subscribers declare their topics
//! once, at construction, and are invoked in registration order within the
//! publishing call chain. Every event is also broadcast to external observers;
//! nothing waits for them and a send without receivers is not an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::error::Result;

/// Number of events kept for diagnostics
const HISTORY_CAPACITY: usize = 512;

/// Broadcast buffer for external observers
const BROADCAST_CAPACITY: usize = 256;

/// Event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    PluginRegistered,
    PluginUnregistered,
    PluginActivated,
    PluginDeactivated,
    PluginActivationFailed,
    PluginMessage,
    CompatibilityChecked,
    ValidationCompleted,
    PermissionRequested,
    PermissionApproved,
    PermissionRejected,
    PermissionRevoked,
    PermissionDenied,
    ResourceViolation,
    ResourceRestricted,
    ResourceDeactivationRequested,
    PluginBlacklisted,
    PluginWhitelisted,
    SandboxError,
    SandboxTimeout,
    StaticAnalysisFailed,
    SecurityEvent,
    SecurityLevelChanged,
    SecurityCheckToggled,
}

impl Topic {
    pub const ALL: [Topic; 24] = [
        Self::PluginRegistered,
        Self::PluginUnregistered,
        Self::PluginActivated,
        Self::PluginDeactivated,
        Self::PluginActivationFailed,
        Self::PluginMessage,
        Self::CompatibilityChecked,
        Self::ValidationCompleted,
        Self::PermissionRequested,
        Self::PermissionApproved,
        Self::PermissionRejected,
        Self::PermissionRevoked,
        Self::PermissionDenied,
        Self::ResourceViolation,
        Self::ResourceRestricted,
        Self::ResourceDeactivationRequested,
        Self::PluginBlacklisted,
        Self::PluginWhitelisted,
        Self::SandboxError,
        Self::SandboxTimeout,
        Self::StaticAnalysisFailed,
        Self::SecurityEvent,
        Self::SecurityLevelChanged,
        Self::SecurityCheckToggled,
    ];

    /// Dotted event name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PluginRegistered => "plugin.registered",
            Self::PluginUnregistered => "plugin.unregistered",
            Self::PluginActivated => "plugin.activated",
            Self::PluginDeactivated => "plugin.deactivated",
            Self::PluginActivationFailed => "plugin.activation_failed",
            Self::PluginMessage => "plugin.message",
            Self::CompatibilityChecked => "compatibility.checked",
            Self::ValidationCompleted => "validation.completed",
            Self::PermissionRequested => "permission.requested",
            Self::PermissionApproved => "permission.approved",
            Self::PermissionRejected => "permission.rejected",
            Self::PermissionRevoked => "permission.revoked",
            Self::PermissionDenied => "permission.denied",
            Self::ResourceViolation => "resource.violation",
            Self::ResourceRestricted => "resource.restricted",
            Self::ResourceDeactivationRequested => "resource.deactivation_requested",
            Self::PluginBlacklisted => "blacklist.added",
            Self::PluginWhitelisted => "blacklist.removed",
            Self::SandboxError => "sandbox.error",
            Self::SandboxTimeout => "sandbox.timeout",
            Self::StaticAnalysisFailed => "sandbox.analysis_failed",
            Self::SecurityEvent => "security.event",
            Self::SecurityLevelChanged => "security.level_changed",
            Self::SecurityCheckToggled => "security.check_toggled",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable fact published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Unique event ID
    pub id: Uuid,
    pub topic: Topic,
    /// Plugin this event concerns, if any
    pub plugin_id: Option<String>,
    /// Structured detail
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    /// Create a new event
    pub fn new(topic: Topic, plugin_id: Option<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            plugin_id,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Create an event about a single plugin
    pub fn for_plugin(topic: Topic, plugin_id: &str, data: serde_json::Value) -> Self {
        Self::new(topic, Some(plugin_id.to_string()), data)
    }

    /// Create an event that concerns no particular plugin
    pub fn global(topic: Topic, data: serde_json::Value) -> Self {
        Self::new(topic, None, data)
    }

    /// Dotted event name
    pub fn name(&self) -> &'static str {
        self.topic.as_str()
    }
}

/// Subscriber trait for receiving bus events
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Handle an event
    async fn handle(&self, event: &PluginEvent) -> Result<()>;

    /// Topics this subscriber is interested in
    fn subscribed_topics(&self) -> &[Topic];
}

struct Subscription {
    topics: Vec<Topic>,
    subscriber: Weak<dyn EventSubscriber>,
}

/// In-process event dispatcher
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    history: RwLock<VecDeque<PluginEvent>>,
    sender: broadcast::Sender<PluginEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new bus with no subscribers
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            sender,
        }
    }

    /// Register a subscriber for the topics it declares
    ///
    /// The bus only holds a weak reference; a dropped subscriber is pruned on
    /// the next publish.
    pub async fn subscribe<S: EventSubscriber + 'static>(&self, subscriber: &Arc<S>) {
        let dynamic: Arc<dyn EventSubscriber> = subscriber.clone();
        let topics = dynamic.subscribed_topics().to_vec();
        self.subscriptions.write().await.push(Subscription {
            topics,
            subscriber: Arc::downgrade(&dynamic),
        });
    }

    /// Receive every published event (external observers)
    pub fn observe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to subscribers and observers
    pub async fn publish(&self, event: PluginEvent) {
        let targets: Vec<Arc<dyn EventSubscriber>> = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.retain(|s| s.subscriber.strong_count() > 0);
            subscriptions
                .iter()
                .filter(|s| s.topics.contains(&event.topic))
                .filter_map(|s| s.subscriber.upgrade())
                .collect()
        };

        {
            let mut history = self.history.write().await;
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        for subscriber in targets {
            if let Err(e) = subscriber.handle(&event).await {
                tracing::warn!(topic = %event.topic, error = %e, "Event subscriber failed");
            }
        }

        let _ = self.sender.send(event);
    }

    /// Recently published events, oldest first
    pub async fn history(&self) -> Vec<PluginEvent> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Recently published events with the given topic
    pub async fn events_by_topic(&self, topic: Topic) -> Vec<PluginEvent> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Recently published events about a plugin
    pub async fn events_for(&self, plugin_id: &str) -> Vec<PluginEvent> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.plugin_id.as_deref() == Some(plugin_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        seen: AtomicUsize,
        topics: Vec<Topic>,
    }

    #[async_trait]
    impl EventSubscriber for Counter {
        async fn handle(&self, _event: &PluginEvent) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribed_topics(&self) -> &[Topic] {
            &self.topics
        }
    }

    fn counter(topics: &[Topic]) -> Arc<Counter> {
        Arc::new(Counter {
            seen: AtomicUsize::new(0),
            topics: topics.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_respects_topics() {
        let bus = EventBus::new();
        let activations = counter(&[Topic::PluginActivated]);
        bus.subscribe(&activations).await;

        bus.publish(PluginEvent::for_plugin(Topic::PluginActivated, "a", serde_json::json!({})))
            .await;
        bus.publish(PluginEvent::for_plugin(Topic::PluginDeactivated, "a", serde_json::json!({})))
            .await;

        assert_eq!(activations.seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let sub = counter(&[Topic::SecurityEvent]);
        bus.subscribe(&sub).await;
        drop(sub);

        bus.publish(PluginEvent::global(Topic::SecurityEvent, serde_json::json!({})))
            .await;
        assert!(bus.subscriptions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_observers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.observe();

        bus.publish(PluginEvent::for_plugin(Topic::PluginBlacklisted, "evil", serde_json::json!({"reason": "test"})))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "blacklist.added");
        assert_eq!(event.plugin_id.as_deref(), Some("evil"));
    }

    #[tokio::test]
    async fn test_events_filtering() {
        let bus = EventBus::new();
        bus.publish(PluginEvent::for_plugin(Topic::PluginActivated, "a", serde_json::json!({})))
            .await;
        bus.publish(PluginEvent::for_plugin(Topic::PluginActivated, "b", serde_json::json!({})))
            .await;

        assert_eq!(bus.events_by_topic(Topic::PluginActivated).await.len(), 2);
        assert_eq!(bus.events_for("b").await.len(), 1);
    }

    #[test]
    fn test_topic_names_are_unique() {
        let mut names: Vec<&str> = Topic::ALL.iter().map(|t| t.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Topic::ALL.len());
    }
}
