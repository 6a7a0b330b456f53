//! # mqbgp
//!
//! mqbgp relays the JSON monitoring stream of an ExaBGP speaker onto a message bus.
//!
//! Each line read from the speaker is decoded into an [Envelope]; every prefix
//! announced or withdrawn by an `update` message becomes one [PrefixEvent],
//! published as a [PrefixMessage] by the [ReliablePublisher].
//!
//! The broker is abstracted by the [Broker] trait. The MQTT implementation
//! lives in [transports::mqtt] behind the `mqtt` feature.

pub mod error;
pub mod extract;
pub mod models;
pub mod publisher;
#[cfg(feature = "mqtt")]
pub mod transports;

pub use error::{DecodeError, ExtractionGap, FatalInputError, PublishError, TransportError};
pub use models::{
    BusMessage, Envelope, MessageKind, NeighborContext, PrefixAction, PrefixEvent,
    PrefixListMessage, PrefixListRequestMessage, PrefixMessage, Update,
};
pub use publisher::{PublisherState, PublisherStats, ReliablePublisher};

use itertools::Itertools;
use std::fmt::{Display, Formatter};
use std::io;
use tracing::{debug, error, info, warn};

/// Consecutive empty lines after which the producer is assumed gone.
pub const DEFAULT_IDLE_LIMIT: usize = 100;

/// A message broker able to open publishing connections.
pub trait Broker {
    type Connection: BrokerConnection;

    /// Broker address, for log messages
    fn address(&self) -> String;

    /// Open a new connection
    fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// An open broker connection.
pub trait BrokerConnection: Sized {
    /// Send one payload and wait until the broker has taken it
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Close the connection
    fn close(self) -> Result<(), TransportError>;

    /// Give up a connection that already failed, without waiting on the broker
    fn abandon(self) {}
}

/// Why the relay loop stopped.
#[derive(Debug)]
pub enum RelayExit {
    /// too many consecutive empty lines
    IdleLimit,
    EndOfInput,
    Interrupted,
    InputError(FatalInputError),
}

impl Display for RelayExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayExit::IdleLimit => write!(f, "idle input limit reached"),
            RelayExit::EndOfInput => write!(f, "end of input"),
            RelayExit::Interrupted => write!(f, "interrupted"),
            RelayExit::InputError(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// non-empty lines read
    pub lines: u64,
    /// lines that could not be decoded
    pub decode_errors: u64,
    /// update messages carrying an update block
    pub updates: u64,
    /// prefix events derived from updates
    pub events: u64,
}

/// Reads ExaBGP output line by line and publishes the derived prefix events in order.
pub struct Relay<B: Broker> {
    publisher: ReliablePublisher<B>,
    idle_limit: usize,
    stats: RelayStats,
}

impl<B: Broker> Relay<B> {
    pub fn new(publisher: ReliablePublisher<B>) -> Self {
        Relay {
            publisher,
            idle_limit: DEFAULT_IDLE_LIMIT,
            stats: RelayStats::default(),
        }
    }

    /// Stop after more than `idle_limit` consecutive empty lines
    pub fn with_idle_limit(mut self, idle_limit: usize) -> Self {
        self.idle_limit = idle_limit;
        self
    }

    pub fn publisher(&self) -> &ReliablePublisher<B> {
        &self.publisher
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Consume input lines until the input ends, fails, is interrupted, or goes idle.
    ///
    /// Lines are raw bytes or text; a line that is not valid UTF-8 is skipped
    /// like any other undecodable line. An [io::ErrorKind::Interrupted] item is
    /// an interrupt request. The publisher is disconnected exactly once before
    /// returning.
    pub fn run<I, L>(&mut self, lines: I) -> RelayExit
    where
        I: IntoIterator<Item = io::Result<L>>,
        L: AsRef<[u8]>,
    {
        let mut idle = 0;
        let mut lines = lines.into_iter();

        let exit = loop {
            let raw = match lines.next() {
                None => break RelayExit::EndOfInput,
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    break RelayExit::Interrupted
                }
                Some(Err(e)) => break RelayExit::InputError(FatalInputError(e)),
                Some(Ok(raw)) => raw,
            };

            let line = match std::str::from_utf8(raw.as_ref()) {
                Ok(line) => line.trim(),
                Err(e) => {
                    idle = 0;
                    self.stats.lines += 1;
                    self.skip_undecodable(DecodeError::from(e));
                    continue;
                }
            };
            if line.is_empty() {
                idle += 1;
                if idle > self.idle_limit {
                    break RelayExit::IdleLimit;
                }
                continue;
            }
            idle = 0;

            self.process_line(line);
        };

        match &exit {
            RelayExit::InputError(e) => error!("stop relaying: {}", e),
            _ => info!("stop relaying: {}", exit),
        }
        self.publisher.disconnect();
        exit
    }

    /// Decode one non-empty line and publish its prefix events.
    ///
    /// Returns the number of events delivered. Every failure is logged and
    /// confined to this line.
    pub fn process_line(&mut self, line: &str) -> usize {
        self.stats.lines += 1;

        let envelope = match Envelope::decode(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.skip_undecodable(e);
                return 0;
            }
        };

        if !envelope.is_update() {
            debug!("skip {} message #{}", envelope.kind, envelope.counter);
            return 0;
        }

        let update = match envelope.update() {
            Ok(update) => update,
            Err(gap) => {
                debug!("skip update #{}: {}", envelope.counter, gap);
                return 0;
            }
        };
        self.stats.updates += 1;

        let events = extract::derive_events(envelope.timestamp, &update);
        self.stats.events += events.len() as u64;

        let mut delivered = 0;
        for event in &events {
            match self.publisher.publish(event) {
                Ok(()) => delivered += 1,
                Err(e) => error!(
                    "drop {} {} (asn {}, path [{}]): {}",
                    event.action(),
                    event.prefix,
                    event.origin_asn,
                    event.as_path.iter().join(" "),
                    e
                ),
            }
        }
        delivered
    }

    fn skip_undecodable(&mut self, error: DecodeError) {
        self.stats.decode_errors += 1;
        warn!("skip undecodable line: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::tests::ScriptedBroker;

    const ANNOUNCE: &str = r#"{"exabgp": "4.0.1", "time": 1578573466.0, "host": "rs1", "pid": 1, "ppid": 1, "counter": 1, "type": "update", "neighbor": {"address": {"local": "192.168.1.2", "peer": "192.168.1.1"}, "asn": {"local": 65521, "peer": 65520}, "direction": "receive", "message": {"update": {"attribute": {"origin": "igp", "as-path": [200020, 3333], "community": [[65432, 3000]]}, "announce": {"ipv4 unicast": {"172.30.4.1": [{"nlri": "193.0.20.0/23"}, {"nlri": "193.0.12.0/23"}]}}}}}}"#;

    fn relay() -> (ScriptedBroker, Relay<ScriptedBroker>) {
        let broker = ScriptedBroker::default();
        let relay = Relay::new(ReliablePublisher::new(broker.clone(), "prefix"));
        (broker, relay)
    }

    fn lines(input: &[&str]) -> Vec<io::Result<String>> {
        input.iter().map(|line| Ok(line.to_string())).collect()
    }

    #[test]
    fn test_process_line() {
        let (broker, mut relay) = relay();
        assert_eq!(relay.process_line(ANNOUNCE), 2);
        assert_eq!(relay.process_line("{garbage"), 0);
        assert_eq!(relay.process_line(r#"{"time": 1, "type": "state"}"#), 0);

        let stats = relay.stats();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(broker.0.borrow().delivered.len(), 2);
    }

    #[test]
    fn test_idle_limit() {
        let (broker, relay) = relay();
        let mut relay = relay.with_idle_limit(3);

        let exit = relay.run(lines(&["", " ", "", ANNOUNCE, "", "", "", "", ANNOUNCE]));
        assert!(matches!(exit, RelayExit::IdleLimit));
        assert_eq!(broker.0.borrow().delivered.len(), 2);
        assert_eq!(broker.0.borrow().closes, 1);
    }

    #[test]
    fn test_interrupt() {
        let (broker, mut relay) = relay();
        let mut input = lines(&[ANNOUNCE]);
        input.push(Err(io::Error::new(io::ErrorKind::Interrupted, "interrupt")));
        input.push(Ok(ANNOUNCE.to_string()));

        assert!(matches!(relay.run(input), RelayExit::Interrupted));
        assert_eq!(broker.0.borrow().delivered.len(), 2);
        assert_eq!(broker.0.borrow().closes, 1);
        assert_eq!(relay.publisher().state(), PublisherState::Disconnected);
    }

    #[test]
    fn test_input_error() {
        let (broker, mut relay) = relay();
        let mut input = lines(&[ANNOUNCE]);
        input.push(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed")));
        input.push(Ok(ANNOUNCE.to_string()));

        assert!(matches!(relay.run(input), RelayExit::InputError(_)));
        assert_eq!(broker.0.borrow().delivered.len(), 2);
        assert_eq!(broker.0.borrow().closes, 1);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let (broker, mut relay) = relay();
        let input: Vec<io::Result<Vec<u8>>> = vec![
            Ok(b"{\"time\": 1, \"type\": \"update\", \"host\": \"r\xff\"}".to_vec()),
            Ok(ANNOUNCE.as_bytes().to_vec()),
        ];

        assert!(matches!(relay.run(input), RelayExit::EndOfInput));
        assert_eq!(relay.stats().lines, 2);
        assert_eq!(relay.stats().decode_errors, 1);
        assert_eq!(broker.0.borrow().delivered.len(), 2);
    }

    #[test]
    fn test_invalid_utf8_resets_idle_count() {
        let (broker, relay) = relay();
        let mut relay = relay.with_idle_limit(2);
        let input: Vec<io::Result<Vec<u8>>> = vec![
            Ok(b"".to_vec()),
            Ok(b"  ".to_vec()),
            Ok(vec![0xfe, 0xff]),
            Ok(b"".to_vec()),
            Ok(b"".to_vec()),
            Ok(ANNOUNCE.as_bytes().to_vec()),
        ];

        assert!(matches!(relay.run(input), RelayExit::EndOfInput));
        assert_eq!(broker.0.borrow().delivered.len(), 2);
    }

    #[test]
    fn test_end_of_input() {
        let (broker, mut relay) = relay();
        assert!(matches!(relay.run(lines(&[ANNOUNCE])), RelayExit::EndOfInput));
        assert_eq!(broker.0.borrow().closes, 1);
    }
}
