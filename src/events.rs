//! In-process pub/sub for live notifications.
//!
//! Two subscriber universes: admin (receives everything) and portal (keyed
//! by inbox email). Each subscriber owns a bounded queue; publishing never
//! blocks, and a subscriber whose queue is full is dropped on the spot.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Alert, Event, Stage};

/// Per-subscriber queue capacity.
pub const QUEUE_CAPACITY: usize = 50;
/// Idle interval after which the wire gets a keepalive instead of an event.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// SSE comment frame emitted on idle.
pub const SSE_KEEPALIVE: &str = ": keepalive\n\n";

/// A live subscription handle. Dropping the handle disconnects; the bus
/// notices on the next publish and removes the queue.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Event>,
}

#[derive(Default)]
struct Registry {
    admin: HashMap<Uuid, mpsc::Sender<Event>>,
    portal: HashMap<String, HashMap<Uuid, mpsc::Sender<Event>>>,
}

/// Event fan-out hub. One per process, created at startup and passed
/// explicitly to the scanner and transport layers.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_admin(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.admin.insert(id, sender);
        Subscription { id, receiver }
    }

    pub fn unsubscribe_admin(&self, id: Uuid) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.admin.remove(&id);
    }

    pub fn subscribe_portal(&self, email: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .portal
            .entry(email.to_string())
            .or_default()
            .insert(id, sender);
        Subscription { id, receiver }
    }

    pub fn unsubscribe_portal(&self, email: &str, id: Uuid) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = registry.portal.get_mut(email) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                registry.portal.remove(email);
            }
        }
    }

    /// Broadcast to every admin subscriber. Slow or disconnected consumers
    /// are removed rather than awaited.
    pub fn broadcast_admin(&self, event: Event) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        Self::fan_out(&mut registry.admin, &event);
    }

    /// Broadcast to the portal subscribers of one inbox email.
    pub fn broadcast_portal(&self, email: &str, event: Event) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut emptied = false;
        if let Some(subscribers) = registry.portal.get_mut(email) {
            Self::fan_out(subscribers, &event);
            emptied = subscribers.is_empty();
        }
        if emptied {
            registry.portal.remove(email);
        }
    }

    fn fan_out(subscribers: &mut HashMap<Uuid, mpsc::Sender<Event>>, event: &Event) {
        let mut dead = Vec::new();
        for (id, sender) in subscribers.iter() {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("dropping slow event subscriber {id}");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("removing disconnected event subscriber {id}");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }

    /// Notify about a new message landing in an inbox. Producer API for
    /// transport layers; the scanner itself does not emit these.
    pub fn notify_new_email(&self, email: &str, subject: &str, from: &str) {
        let data = json!({
            "email": email,
            "subject": subject,
            "from": from,
        });
        self.broadcast_admin(Event::new("new_email", data.clone()));
        self.broadcast_portal(email, Event::new("new_email", data));
    }

    /// Notify about a stage promotion.
    pub fn notify_stage_change(&self, email: &str, old_stage: Stage, new_stage: Stage) {
        let data = json!({
            "email": email,
            "old_stage": old_stage,
            "new_stage": new_stage,
        });
        self.broadcast_admin(Event::new("stage_change", data.clone()));
        self.broadcast_portal(email, Event::new("stage_change", data));
    }

    /// Notify admins about a new alert.
    pub fn notify_alert(&self, alert: &Alert) {
        match serde_json::to_value(alert) {
            Ok(data) => self.broadcast_admin(Event::new("alert", data)),
            Err(e) => warn!("failed to serialize alert event: {e}"),
        }
    }

    pub fn admin_count(&self) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.admin.len()
    }

    pub fn portal_count(&self) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.portal.values().map(HashMap::len).sum()
    }
}

/// Encode one event as an SSE frame: `event: <type>\ndata: <json>\n\n`.
pub fn sse_frame(event: &Event) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.event_type, data)
}

/// Await the next wire frame for a subscription: an event frame, a
/// keepalive after 30 s of silence, or `None` once the bus dropped the
/// subscriber.
pub async fn next_frame(subscription: &mut Subscription) -> Option<String> {
    match tokio::time::timeout(KEEPALIVE_INTERVAL, subscription.receiver.recv()).await {
        Ok(Some(event)) => Some(sse_frame(&event)),
        Ok(None) => None,
        Err(_) => Some(SSE_KEEPALIVE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;

    #[tokio::test]
    async fn test_admin_receives_all_events() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe_admin();

        bus.notify_stage_change("a@fleet.test", Stage::Registered, Stage::Active);
        bus.notify_new_email("b@fleet.test", "Hello", "x@y.z");

        let first = subscription.receiver.recv().await.unwrap();
        assert_eq!(first.event_type, "stage_change");
        assert_eq!(first.data["old_stage"], "REGISTERED");
        assert_eq!(first.data["new_stage"], "ACTIVE");

        let second = subscription.receiver.recv().await.unwrap();
        assert_eq!(second.event_type, "new_email");
    }

    #[tokio::test]
    async fn test_portal_subscribers_keyed_by_email() {
        let bus = EventBus::new();
        let mut mine = bus.subscribe_portal("a@fleet.test");
        let mut other = bus.subscribe_portal("b@fleet.test");

        bus.notify_stage_change("a@fleet.test", Stage::Registered, Stage::BgcPending);

        let event = mine.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, "stage_change");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_without_blocking() {
        let bus = EventBus::new();
        let _subscription = bus.subscribe_admin();
        assert_eq!(bus.admin_count(), 1);

        // Fill the queue to capacity, then overflow by one
        for i in 0..=QUEUE_CAPACITY {
            bus.notify_new_email("a@fleet.test", &format!("msg {i}"), "x@y.z");
        }

        assert_eq!(bus.admin_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_removed_on_publish() {
        let bus = EventBus::new();
        let subscription = bus.subscribe_portal("a@fleet.test");
        assert_eq!(bus.portal_count(), 1);

        drop(subscription);
        bus.notify_new_email("a@fleet.test", "Hello", "x@y.z");
        assert_eq!(bus.portal_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let admin = bus.subscribe_admin();
        let portal = bus.subscribe_portal("a@fleet.test");

        bus.unsubscribe_admin(admin.id);
        bus.unsubscribe_portal("a@fleet.test", portal.id);

        assert_eq!(bus.admin_count(), 0);
        assert_eq!(bus.portal_count(), 0);
    }

    #[tokio::test]
    async fn test_alert_events_reach_admins() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe_admin();

        let alert = Alert::new(
            Uuid::new_v4(),
            "deactivation",
            Severity::Critical,
            "a@fleet.test: ACTIVE -> DEACTIVATED",
            Some("Your Dasher Account Has Been Deactivated".to_string()),
            Utc::now(),
        );
        bus.notify_alert(&alert);

        let event = subscription.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, "alert");
        assert_eq!(event.data["severity"], "critical");
    }

    #[test]
    fn test_sse_frame_format() {
        let event = Event::new("stage_change", json!({"email": "a@b.c"}));
        let frame = sse_frame(&event);
        assert!(frame.starts_with("event: stage_change\ndata: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"stage_change\""));
    }

    #[tokio::test]
    async fn test_next_frame_delivers_event() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe_admin();
        bus.notify_new_email("a@fleet.test", "Hi", "x@y.z");

        let frame = next_frame(&mut subscription).await.unwrap();
        assert!(frame.starts_with("event: new_email\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_frame_keepalive_on_idle() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe_admin();

        let frame = tokio::spawn(async move { next_frame(&mut subscription).await });
        tokio::time::advance(KEEPALIVE_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(frame.await.unwrap().unwrap(), SSE_KEEPALIVE);
    }
}
