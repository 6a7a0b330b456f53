//! MQTT broker transport on top of the synchronous [rumqttc] client.
//!
//! The event loop of each connection is driven inline: a publish returns once
//! the packet is written (QoS 0) or acknowledged (QoS 1 and 2), so a broken
//! connection surfaces as an error of the publish that hit it.
//!
//! RabbitMQ's MQTT plugin maps topic `prefix/announce` to routing key
//! `prefix.announce` on its topic exchange.

use crate::error::TransportError;
use crate::{Broker, BrokerConnection};
use itertools::Itertools;
use rumqttc::{
    Client, Connection, ConnectionError, Event, Incoming, MqttOptions, Outgoing, QoS,
    RecvTimeoutError, SubAck, SubscribeFilter, SubscribeReasonCode,
};
use std::time::{Duration, Instant};
use tracing::debug;

const REQUEST_CAPACITY: usize = 16;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: QoS,
    pub keep_alive: Duration,
    /// upper bound for connect, publish acknowledgement and disconnect waits
    pub send_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("mqbgp-{}", std::process::id()),
            username: None,
            password: None,
            qos: QoS::AtLeastOnce,
            keep_alive: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Map an MQTT QoS level number to [QoS].
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub struct MqttBroker {
    config: MqttConfig,
}

impl MqttBroker {
    pub fn new(config: MqttConfig) -> Self {
        MqttBroker { config }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.as_str(),
            self.config.host.as_str(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive.max(MIN_KEEP_ALIVE));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.as_str(), password.as_str());
        }
        options
    }

    /// Connect and subscribe to all `filters`.
    ///
    /// Fails with [TransportError::Refused] when the broker rejects any filter.
    pub fn subscribe(&self, filters: &[String]) -> Result<MqttSubscription, TransportError> {
        let mut connection = self.connect()?;
        let qos = connection.qos;
        connection
            .client
            .subscribe_many(
                filters
                    .iter()
                    .map(|filter| SubscribeFilter::new(filter.clone(), qos)),
            )
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;

        let deadline = Instant::now() + connection.timeout;
        loop {
            if let Event::Incoming(Incoming::SubAck(suback)) = connection.next_event(deadline)? {
                check_suback(&suback, filters)?;
                debug!("subscribed to {}", filters.iter().join(", "));
                return Ok(MqttSubscription { connection });
            }
        }
    }
}

impl Broker for MqttBroker {
    type Connection = MqttConnection;

    fn address(&self) -> String {
        format!("mqtt://{}:{}", self.config.host, self.config.port)
    }

    fn connect(&self) -> Result<MqttConnection, TransportError> {
        let (client, connection) = Client::new(self.options(), REQUEST_CAPACITY);
        let mut connection = MqttConnection {
            client,
            connection,
            qos: self.config.qos,
            timeout: self.config.send_timeout,
        };

        let deadline = Instant::now() + connection.timeout;
        loop {
            match connection.next_event(deadline) {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(connection),
                Ok(_) => continue,
                Err(TransportError::ConnectionLost(reason)) => {
                    return Err(TransportError::Connect {
                        address: self.address(),
                        reason,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct MqttConnection {
    client: Client,
    connection: Connection,
    qos: QoS,
    timeout: Duration,
}

impl MqttConnection {
    /// Poll the event loop until the next event or `deadline`.
    fn next_event(&mut self, deadline: Instant) -> Result<Event, TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.connection.recv_timeout(remaining) {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(e)) => Err(classify(e)),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::InvalidState(
                "event loop stopped".to_string(),
            )),
        }
    }
}

fn classify(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{:?}", code)),
        ConnectionError::RequestsDone => {
            TransportError::InvalidState("request channel closed".to_string())
        }
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

fn check_suback(suback: &SubAck, filters: &[String]) -> Result<(), TransportError> {
    let refused = suback
        .return_codes
        .iter()
        .zip(filters)
        .filter(|(code, _)| matches!(code, SubscribeReasonCode::Failure))
        .map(|(_, filter)| filter.as_str())
        .join(", ");
    match refused.is_empty() {
        true => Ok(()),
        false => Err(TransportError::Refused(format!(
            "subscription to {} rejected",
            refused
        ))),
    }
}

impl BrokerConnection for MqttConnection {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client
            .publish(topic, self.qos, false, payload.to_vec())
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match (self.qos, self.next_event(deadline)?) {
                (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_)))
                | (QoS::AtLeastOnce, Event::Incoming(Incoming::PubAck(_)))
                | (QoS::ExactlyOnce, Event::Incoming(Incoming::PubComp(_))) => return Ok(()),
                _ => continue,
            }
        }
    }

    fn close(mut self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Event::Outgoing(Outgoing::Disconnect) = self.next_event(deadline)? {
                return Ok(());
            }
        }
    }
}

/// A message received on a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct MqttSubscription {
    connection: MqttConnection,
}

impl MqttSubscription {
    /// Wait up to `wait` for the next published message.
    ///
    /// `Ok(None)` means nothing arrived in time; the connection is still usable.
    pub fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        match self.connection.next_event(Instant::now() + wait) {
            Ok(Event::Incoming(Incoming::Publish(publish))) => Ok(Some(Delivery {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            })),
            Ok(_) | Err(TransportError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn close(self) -> Result<(), TransportError> {
        self.connection.close()
    }
}
