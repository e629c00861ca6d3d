//! Observer fan-out for lifecycle, time and amplitude updates
//!
//! Publishers push `Notification`s into a broadcast channel. Each subscriber
//! owns a `Subscription`; dropping it unsubscribes. Notifications are
//! delivered on whatever task calls `recv`, the core never marshals to a UI
//! thread.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::state_machine::LifecycleState;

/// Default number of notifications buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(LifecycleState),
    /// Elapsed recording time, or the playback cursor.
    TimeUpdated(Duration),
    /// Amplitude level in [0.0, 1.0].
    AmplitudeUpdated(f32),
}

/// Cloneable publishing side.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            log::trace!("Notification dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receiving side of one observer.
pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
}

impl Subscription {
    /// Next notification, or `None` once every publisher is gone.
    /// A slow subscriber skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Subscriber lagged, skipped {} notifications", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(notification) => return Some(notification),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("Subscriber lagged, skipped {} notifications", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let notifier = Notifier::new(16);
        let mut sub = notifier.subscribe();

        notifier.publish(Notification::StateChanged(LifecycleState::Recording));
        notifier.publish(Notification::AmplitudeUpdated(0.5));
        notifier.publish(Notification::TimeUpdated(Duration::from_millis(100)));

        assert_eq!(
            sub.recv().await,
            Some(Notification::StateChanged(LifecycleState::Recording))
        );
        assert_eq!(sub.recv().await, Some(Notification::AmplitudeUpdated(0.5)));
        assert_eq!(
            sub.recv().await,
            Some(Notification::TimeUpdated(Duration::from_millis(100)))
        );
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let notifier = Notifier::new(4);
        let sub = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(sub);
        assert_eq!(notifier.subscriber_count(), 0);
        // Publishing with nobody listening is fine
        notifier.publish(Notification::AmplitudeUpdated(0.1));
    }

    #[test]
    fn lagging_subscriber_keeps_newest() {
        let notifier = Notifier::new(2);
        let mut sub = notifier.subscribe();
        for i in 0..5 {
            notifier.publish(Notification::AmplitudeUpdated(i as f32));
        }
        assert_eq!(
            sub.drain(),
            vec![
                Notification::AmplitudeUpdated(3.0),
                Notification::AmplitudeUpdated(4.0)
            ]
        );
    }
}
