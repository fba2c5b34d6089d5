use crate::common::data::{EventKind, ProxyEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Per-subscriber buffer bound. A subscriber that falls further behind
/// loses the oldest events and gets a single warning.
pub const SUBSCRIBER_BUFFER: usize = 128;

/// Fans lifecycle events out to subscribers. Delivery is asynchronous and
/// best-effort: publishing never blocks on a slow subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    pub(crate) fn publish(&self, event: ProxyEvent) {
        tracing::trace!("publishing {:?} event", event.kind());
        // Absent subscribers are fine; events are observability, not state.
        let _ = self.tx.send(event);
    }

    /// A pull-style subscription over all event kinds. The subscription is
    /// durable once this call returns.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            lag_warned: false,
        }
    }

    /// A push-style subscription: the callback runs on a forwarder task for
    /// every event of the given kind. The subscription is durable once this
    /// call returns; dropping the returned handle unsubscribes.
    pub fn on_event<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(ProxyEvent) + Send + 'static,
    {
        let mut stream = self.subscribe();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if event.kind() == kind {
                    callback(event);
                }
            }
        });

        Subscription { forwarder }
    }
}

/// A live event subscription. Reads lag-compensated: overflowing the
/// per-subscriber buffer drops the oldest events rather than blocking the
/// instance.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<ProxyEvent>,
    lag_warned: bool,
}

impl EventStream {
    /// The next event, or `None` once the instance has shut down.
    pub async fn next(&mut self) -> Option<ProxyEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if !self.lag_warned {
                        self.lag_warned = true;
                        tracing::warn!(
                            "event subscriber lagging, dropped {} event(s); further drops are silent",
                            missed
                        );
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The next event of the given kind, skipping others.
    pub async fn next_of(&mut self, kind: EventKind) -> Option<ProxyEvent> {
        loop {
            match self.next().await {
                Some(event) if event.kind() == kind => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// Keeps a push-style subscription alive.
#[derive(Debug)]
pub struct Subscription {
    forwarder: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::FailedTlsRequest;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn tls_event(cause: &str) -> ProxyEvent {
        ProxyEvent::FailedTlsRequest(Arc::new(FailedTlsRequest {
            failure_cause: cause.to_string(),
            hostname: None,
            remote_ip: "127.0.0.1".parse().unwrap(),
        }))
    }

    #[tokio::test]
    async fn subscribe_receives_published_events_test() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        bus.publish(tls_event("one"));

        match stream.next().await.unwrap() {
            ProxyEvent::FailedTlsRequest(record) => assert_eq!(record.failure_cause, "one"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_events_after_subscription_test() {
        let bus = EventBus::new();

        bus.publish(tls_event("before"));
        let mut stream = bus.subscribe();
        bus.publish(tls_event("after"));

        match stream.next().await.unwrap() {
            ProxyEvent::FailedTlsRequest(record) => assert_eq!(record.failure_cause, "after"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_events_test() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(tls_event(&i.to_string()));
        }

        // The first delivered event is a later one; the oldest were dropped.
        match stream.next().await.unwrap() {
            ProxyEvent::FailedTlsRequest(record) => {
                assert_ne!(record.failure_cause, "0");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn on_event_filters_by_kind_test() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let _subscription = bus.on_event(EventKind::FailedTlsRequest, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(tls_event("x"));
        bus.publish(tls_event("y"));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
