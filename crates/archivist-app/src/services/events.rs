//! Corpus-changed signals feeding the all-corpus coordinator.

use std::pin::Pin;
use std::time::Duration;

use async_stream::stream;
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use futures::stream::Stream;
use tokio::time::{MissedTickBehavior, interval_at, Instant};

/// "The corpus may have changed as of `instant`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub instant: DateTime<Utc>,
}

impl Event {
    pub fn now() -> Self {
        Self {
            instant: Utc::now(),
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

pub trait EventSource: Send + Sync {
    fn receive(&self) -> EventStream;
}

/// Emits one event every `period`, starting one period from now.
#[derive(Debug, Clone, Copy)]
pub struct IntervalEventSource {
    period: Duration,
}

impl IntervalEventSource {
    pub fn new(period: Duration) -> Self {
        debug_assert!(!period.is_zero());
        Self { period }
    }
}

impl EventSource for IntervalEventSource {
    fn receive(&self) -> EventStream {
        let period = self.period;
        Box::pin(stream! {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                yield Event::now();
            }
        })
    }
}

/// In-process queue; every [`EventPublisher`] clone feeds the same stream.
#[derive(Debug, Clone)]
pub struct QueueEventSource {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl QueueEventSource {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
        }
    }
}

impl Default for QueueEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for QueueEventSource {
    fn receive(&self) -> EventStream {
        Box::pin(self.rx.clone().into_stream())
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: Sender<Event>,
}

impl EventPublisher {
    /// Returns `false` once every receiver is gone.
    pub fn publish(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn queue_delivers_in_publish_order() {
        let source = QueueEventSource::new();
        let publisher = source.publisher();
        let mut events = source.receive();
        let first = Event::now();
        let second = Event {
            instant: first.instant + chrono::Duration::seconds(1),
        };
        assert!(publisher.publish(first));
        assert!(publisher.publish(second));
        assert_eq!(events.next().await, Some(first));
        assert_eq!(events.next().await, Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_waits_one_period_before_first_event() {
        let source = IntervalEventSource::new(Duration::from_secs(60));
        let mut events = source.receive();
        let started = Instant::now();
        events.next().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        events.next().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }
}
