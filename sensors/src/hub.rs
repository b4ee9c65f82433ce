//! Real-time fan-out to websocket clients
//!
//! Every subscriber gets its own bounded queue. Publishing never waits: a
//! subscriber whose queue is full (or whose receiver is gone) is dropped and
//! has to reconnect.

use crate::control::ControlEvent;
use crate::FusedReading;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Message pushed to real-time clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Reading(FusedReading),
    ControlEvent(ControlEvent),
}

/// Receiving end handed to one client
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<HubMessage>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubMessage> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct BroadcastHub {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<HubMessage>>>,
}

impl BroadcastHub {
    /// `capacity` is the per-subscriber queue depth.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        tracing::debug!(subscriber = id, "Hub subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver to every subscriber. Returns how many received the message.
    pub fn publish(&self, message: HubMessage) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Hub subscriber lagging, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = id, "Hub subscriber gone");
                false
            }
        });
        delivered
    }

    pub fn publish_reading(&self, reading: &FusedReading) -> usize {
        self.publish(HubMessage::Reading(reading.clone()))
    }

    pub fn publish_event(&self, event: &ControlEvent) -> usize {
        self.publish(HubMessage::ControlEvent(event.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReadingCondition;
    use chrono::{TimeZone, Utc};

    fn reading(temp: f64) -> FusedReading {
        FusedReading {
            device_id: "tilt:red".into(),
            sg_filtered: 1.040,
            temp_filtered_c: temp,
            confidence: 0.9,
            anomaly: false,
            anomalies: vec![],
            predicted_completion: None,
            observed_at: Utc.with_ymd_and_hms(2024, 9, 1, 8, 30, 0).unwrap(),
            condition: ReadingCondition::Nominal,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let hub = BroadcastHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.publish_reading(&reading(19.0)), 2);
        assert_eq!(a.recv().await, Some(HubMessage::Reading(reading(19.0))));
        assert_eq!(b.recv().await, Some(HubMessage::Reading(reading(19.0))));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_affecting_others() {
        let hub = BroadcastHub::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for i in 0..3 {
            hub.publish_reading(&reading(19.0 + i as f64));
            assert!(fast.try_recv().is_some());
        }
        assert_eq!(hub.subscriber_count(), 1);

        // the slow one drains what it had, then sees the disconnect
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert_eq!(slow.recv().await, None);
    }

    #[test]
    fn closed_subscriber_is_removed() {
        let hub = BroadcastHub::new(4);
        let sub = hub.subscribe();
        drop(sub);
        assert_eq!(hub.publish_reading(&reading(19.0)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribed_client_sees_end_of_stream() {
        let hub = BroadcastHub::new(1);
        let mut sub = hub.subscribe();
        hub.unsubscribe(sub.id());
        assert_eq!(tokio_test::block_on(sub.recv()), None);
    }

    #[test]
    fn messages_are_tagged_with_utc_timestamps() {
        let json = serde_json::to_value(HubMessage::Reading(reading(19.25))).unwrap();
        assert_eq!(json["type"], "reading");
        assert_eq!(json["observed_at"], "2024-09-01T08:30:00Z");
        assert_eq!(json["temp_filtered_c"], 19.25);
    }
}
