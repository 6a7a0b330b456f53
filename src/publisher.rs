//! Publish prefix events to a message broker, reconnecting once on transport failure.

use crate::error::{PublishError, TransportError};
use crate::models::{PrefixAction, PrefixEvent};
use crate::{Broker, BrokerConnection};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublisherStats {
    /// events delivered to the broker
    pub published: u64,
    /// events given up on
    pub dropped: u64,
    /// connections replaced after a transport failure
    pub reconnects: u64,
}

/// Owns the broker connection and delivers one event at a time.
///
/// A send failing with a transient [TransportError] tears down the connection,
/// connects again and retries the same event exactly once.
pub struct ReliablePublisher<B: Broker> {
    broker: B,
    topic_root: String,
    connection: Option<B::Connection>,
    state: PublisherState,
    stats: PublisherStats,
}

impl<B: Broker> ReliablePublisher<B> {
    /// Create a disconnected publisher; events go to `<topic_root>/announce` and `<topic_root>/withdraw`.
    pub fn new(broker: B, topic_root: &str) -> Self {
        ReliablePublisher {
            broker,
            topic_root: topic_root.trim_end_matches('/').to_string(),
            connection: None,
            state: PublisherState::Disconnected,
            stats: PublisherStats::default(),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn topic(&self, action: PrefixAction) -> String {
        format!("{}/{}", self.topic_root, action)
    }

    /// Connect to the broker unless a connection is already held.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        self.state = PublisherState::Connecting;
        self.open()
    }

    /// Deliver one event.
    ///
    /// Encoding failures and non-transient refusals are returned without retrying.
    pub fn publish(&mut self, event: &PrefixEvent) -> Result<(), PublishError> {
        let topic = self.topic(event.action());
        let payload = event.to_message().encode()?;

        match self.deliver(&topic, &payload) {
            Ok(()) => {
                self.stats.published += 1;
                debug!(
                    "published {} {} to {}",
                    event.action(),
                    event.prefix.as_str(),
                    topic.as_str()
                );
                Ok(())
            }
            Err(e) => {
                self.stats.dropped += 1;
                Err(e)
            }
        }
    }

    /// Release the connection. Calling this without a connection does nothing.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            match connection.close() {
                Ok(()) => info!("disconnected from broker {}", self.broker.address()),
                Err(e) => warn!(
                    "error while disconnecting from broker {}: {}",
                    self.broker.address(),
                    e
                ),
            }
        }
        self.state = PublisherState::Disconnected;
    }

    fn deliver(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.connect().map_err(PublishError::Connect)?;

        let first = match self.send(topic, payload) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if !first.is_transient() {
            return Err(PublishError::Rejected(first));
        }

        warn!(
            "publish to {} failed: {}, reconnecting to broker {}",
            topic,
            first,
            self.broker.address()
        );
        if let Err(retry) = self.reconnect() {
            return Err(PublishError::RetryFailed { first, retry });
        }

        match self.send(topic, payload) {
            Ok(()) => Ok(()),
            Err(retry) => {
                self.teardown();
                Err(PublishError::RetryFailed { first, retry })
            }
        }
    }

    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        match self.connection.as_mut() {
            Some(connection) => connection.publish(topic, payload),
            None => Err(TransportError::InvalidState(
                "no broker connection".to_string(),
            )),
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.teardown();
        self.state = PublisherState::Reconnecting;
        self.open()?;
        self.stats.reconnects += 1;
        Ok(())
    }

    fn open(&mut self) -> Result<(), TransportError> {
        match self.broker.connect() {
            Ok(connection) => {
                info!("connected to broker {}", self.broker.address());
                self.connection = Some(connection);
                self.state = PublisherState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = PublisherState::Disconnected;
                Err(e)
            }
        }
    }

    /// Drop a connection that failed a send.
    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!("abandoning stale connection to {}", self.broker.address());
            connection.abandon();
        }
        self.state = PublisherState::Disconnected;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct Script {
        pub connects: usize,
        pub closes: usize,
        pub abandons: usize,
        pub connect_failures: VecDeque<TransportError>,
        pub send_failures: VecDeque<TransportError>,
        pub delivered: Vec<(String, Vec<u8>)>,
    }

    /// In-memory broker replaying scripted failures.
    #[derive(Default, Clone)]
    pub(crate) struct ScriptedBroker(pub Rc<RefCell<Script>>);

    pub(crate) struct ScriptedConnection(Rc<RefCell<Script>>);

    impl ScriptedBroker {
        pub fn fail_sends(&self, errors: impl IntoIterator<Item = TransportError>) {
            self.0.borrow_mut().send_failures.extend(errors);
        }

        pub fn fail_connects(&self, errors: impl IntoIterator<Item = TransportError>) {
            self.0.borrow_mut().connect_failures.extend(errors);
        }
    }

    impl Broker for ScriptedBroker {
        type Connection = ScriptedConnection;

        fn address(&self) -> String {
            "scripted".to_string()
        }

        fn connect(&self) -> Result<ScriptedConnection, TransportError> {
            let mut script = self.0.borrow_mut();
            if let Some(e) = script.connect_failures.pop_front() {
                return Err(e);
            }
            script.connects += 1;
            Ok(ScriptedConnection(self.0.clone()))
        }
    }

    impl BrokerConnection for ScriptedConnection {
        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
            let mut script = self.0.borrow_mut();
            if let Some(e) = script.send_failures.pop_front() {
                return Err(e);
            }
            script.delivered.push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        fn close(self) -> Result<(), TransportError> {
            self.0.borrow_mut().closes += 1;
            Ok(())
        }

        fn abandon(self) {
            self.0.borrow_mut().abandons += 1;
        }
    }

    fn lost() -> TransportError {
        TransportError::ConnectionLost("connection reset by peer".to_string())
    }

    fn event(prefix: &str, is_announce: bool) -> PrefixEvent {
        PrefixEvent {
            timestamp: 0.0,
            origin_asn: "200020".to_string(),
            prefix: prefix.to_string(),
            next_hop: "172.30.4.1".to_string(),
            is_announce,
            as_path: vec![200020, 3333],
            community: vec![],
        }
    }

    #[test]
    fn test_connects_lazily() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix/");
        assert_eq!(publisher.state(), PublisherState::Disconnected);

        publisher.publish(&event("10.0.0.0/8", true)).unwrap();
        publisher.publish(&event("10.0.0.0/8", false)).unwrap();
        assert_eq!(publisher.state(), PublisherState::Connected);

        let script = broker.0.borrow();
        assert_eq!(script.connects, 1);
        let topics: Vec<&str> = script.delivered.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["prefix/announce", "prefix/withdraw"]);
        assert_eq!(publisher.stats().published, 2);
    }

    #[test]
    fn test_retry_once_after_transient_failure() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix");
        publisher.connect().unwrap();
        broker.fail_sends([lost()]);

        publisher.publish(&event("10.0.0.0/8", true)).unwrap();

        let script = broker.0.borrow();
        assert_eq!(script.delivered.len(), 1);
        assert_eq!(script.connects, 2);
        // the failed connection is abandoned, not closed gracefully
        assert_eq!(script.abandons, 1);
        assert_eq!(script.closes, 0);
        assert_eq!(publisher.stats().reconnects, 1);
        assert_eq!(publisher.state(), PublisherState::Connected);
    }

    #[test]
    fn test_drop_after_second_failure() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix");
        broker.fail_sends([lost(), TransportError::Timeout(Duration::from_secs(10))]);

        let result = publisher.publish(&event("10.0.0.0/8", true));
        assert!(matches!(result, Err(PublishError::RetryFailed { .. })));
        assert_eq!(broker.0.borrow().delivered.len(), 0);
        assert_eq!(publisher.state(), PublisherState::Disconnected);
        assert_eq!(publisher.stats().dropped, 1);
        assert_eq!(broker.0.borrow().abandons, 2);
        assert_eq!(broker.0.borrow().closes, 0);

        // the next event starts from a fresh connection
        publisher.publish(&event("10.1.0.0/16", true)).unwrap();
        assert_eq!(broker.0.borrow().delivered.len(), 1);
        assert_eq!(broker.0.borrow().connects, 3);
    }

    #[test]
    fn test_reconnect_failure() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix");
        publisher.connect().unwrap();
        broker.fail_sends([lost()]);
        broker.fail_connects([TransportError::Connect {
            address: "scripted".to_string(),
            reason: "connection refused".to_string(),
        }]);

        let result = publisher.publish(&event("10.0.0.0/8", true));
        assert!(matches!(
            result,
            Err(PublishError::RetryFailed {
                retry: TransportError::Connect { .. },
                ..
            })
        ));
        assert_eq!(publisher.state(), PublisherState::Disconnected);
        assert_eq!(publisher.stats().reconnects, 0);
    }

    #[test]
    fn test_no_retry_on_refusal() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix");
        broker.fail_sends([TransportError::Refused("not authorized".to_string())]);

        let result = publisher.publish(&event("10.0.0.0/8", true));
        assert!(matches!(result, Err(PublishError::Rejected(_))));
        assert_eq!(broker.0.borrow().connects, 1);
        assert_eq!(publisher.state(), PublisherState::Connected);
    }

    #[test]
    fn test_initial_connect_failure() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix");
        broker.fail_connects([TransportError::Timeout(Duration::from_secs(10))]);

        let result = publisher.publish(&event("10.0.0.0/8", true));
        assert!(matches!(result, Err(PublishError::Connect(_))));
        assert_eq!(publisher.state(), PublisherState::Disconnected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let broker = ScriptedBroker::default();
        let mut publisher = ReliablePublisher::new(broker.clone(), "prefix");
        publisher.disconnect();
        assert_eq!(broker.0.borrow().closes, 0);

        publisher.connect().unwrap();
        publisher.disconnect();
        publisher.disconnect();
        assert_eq!(broker.0.borrow().closes, 1);
        assert_eq!(publisher.state(), PublisherState::Disconnected);
    }
}
