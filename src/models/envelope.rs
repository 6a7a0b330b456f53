use crate::error::{DecodeError, ExtractionGap};
use crate::models::de::string_or_number;
use crate::models::Update;
use serde::Deserialize;
use serde_json::Value;

/// Envelope `type` of the only messages the relay acts on.
pub const UPDATE_KIND: &str = "update";

/// One line of ExaBGP JSON output.
///
/// ```json
/// { "exabgp": "4.0.1", "time": 1578573466.0, "host": "rs1", "pid": 1234, "ppid": 1,
///   "counter": 12, "type": "update", "neighbor": { ... } }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// monotonic message counter of the producer
    pub counter: u64,
    /// ExaBGP JSON encoder version
    pub protocol_version: String,
    pub host: String,
    pub pid: String,
    pub parent_pid: String,
    /// producer timestamp, seconds since epoch
    pub timestamp: f64,
    /// message type, e.g. `update`, `state`, `notification`
    pub kind: String,
    /// neighbor context, only decoded for `update` messages
    pub neighbor: Option<NeighborContext>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    counter: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    exabgp: String,
    #[serde(default, deserialize_with = "string_or_number")]
    host: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pid: String,
    #[serde(default, deserialize_with = "string_or_number")]
    ppid: String,
    time: f64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    neighbor: Option<Value>,
}

impl Envelope {
    /// Decode one raw input line.
    ///
    /// `type` and `time` are mandatory; every other field falls back to an empty value.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(DecodeError::EmptyLine);
        }

        let raw: RawEnvelope = serde_json::from_str(line)?;
        let neighbor = match (raw.kind.as_str(), raw.neighbor) {
            (UPDATE_KIND, Some(value)) => Some(NeighborContext::deserialize(&value)?),
            _ => None,
        };

        Ok(Envelope {
            counter: raw.counter,
            protocol_version: raw.exabgp,
            host: raw.host,
            pid: raw.pid,
            parent_pid: raw.ppid,
            timestamp: raw.time,
            kind: raw.kind,
            neighbor,
        })
    }

    pub fn is_update(&self) -> bool {
        self.kind == UPDATE_KIND
    }

    /// Extract the `neighbor.message.update` payload.
    pub fn update(&self) -> Result<Update, ExtractionGap> {
        self.neighbor
            .as_ref()
            .ok_or(ExtractionGap::MissingNeighbor)?
            .update()
    }
}

/// BGP session information attached to an update.
///
/// ```json
/// "neighbor": {
///     "address": { "local": "192.168.1.2", "peer": "192.168.1.1" },
///     "asn": { "local": "65521", "peer": "65520" },
///     "direction": "receive",
///     "message": { ... }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawNeighbor")]
pub struct NeighborContext {
    pub peer_address: String,
    pub local_address: String,
    pub peer_asn: String,
    pub local_asn: String,
    /// `receive` or `send`
    pub direction: String,
    /// opaque message payload, holds `update` for update messages
    pub message: Value,
}

#[derive(Default, Deserialize)]
struct PeerPair {
    #[serde(default, deserialize_with = "string_or_number")]
    local: String,
    #[serde(default, deserialize_with = "string_or_number")]
    peer: String,
}

#[derive(Deserialize)]
struct RawNeighbor {
    #[serde(default)]
    address: PeerPair,
    #[serde(default)]
    asn: PeerPair,
    #[serde(default, deserialize_with = "string_or_number")]
    direction: String,
    #[serde(default)]
    message: Value,
}

impl From<RawNeighbor> for NeighborContext {
    fn from(raw: RawNeighbor) -> Self {
        NeighborContext {
            peer_address: raw.address.peer,
            local_address: raw.address.local,
            peer_asn: raw.asn.peer,
            local_asn: raw.asn.local,
            direction: raw.direction,
            message: raw.message,
        }
    }
}

impl NeighborContext {
    /// Parse the `update` block of the neighbor message.
    ///
    /// An absent or unparseable block is an [ExtractionGap], not a failure.
    pub fn update(&self) -> Result<Update, ExtractionGap> {
        let update = self
            .message
            .get("update")
            .ok_or(ExtractionGap::MissingUpdate)?;
        Update::deserialize(update).map_err(ExtractionGap::MalformedUpdate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPDATE_LINE: &str = r#"{ "exabgp": "4.0.1", "time": 1578573466.123, "host" : "rs1", "pid" : 2117, "ppid" : 1, "counter": 5, "type": "update", "neighbor": { "address": { "local": "192.168.1.2", "peer": "192.168.1.1" }, "asn": { "local": 65521, "peer": "65520" }, "direction": "receive", "message": { "update": { "attribute": { "origin": "igp", "as-path": [ 200020, 3333 ] }, "announce": { "ipv4 unicast": { "172.30.4.1": [ { "nlri": "193.0.20.0/23" } ] } } } } } }"#;

    #[test]
    fn test_decode_update() {
        let envelope = Envelope::decode(UPDATE_LINE).unwrap();
        assert_eq!(envelope.counter, 5);
        assert_eq!(envelope.protocol_version, "4.0.1");
        assert_eq!(envelope.host, "rs1");
        assert_eq!(envelope.pid, "2117");
        assert_eq!(envelope.parent_pid, "1");
        assert_eq!(envelope.timestamp, 1578573466.123);
        assert!(envelope.is_update());

        let neighbor = envelope.neighbor.as_ref().unwrap();
        assert_eq!(neighbor.peer_address, "192.168.1.1");
        assert_eq!(neighbor.local_address, "192.168.1.2");
        assert_eq!(neighbor.peer_asn, "65520");
        assert_eq!(neighbor.local_asn, "65521");
        assert_eq!(neighbor.direction, "receive");

        let update = envelope.update().unwrap();
        assert!(update.announce.is_some());
    }

    #[test]
    fn test_decode_defaults() {
        let envelope =
            Envelope::decode(r#"  {"time": 1.5, "type": "update", "neighbor": {}}  "#).unwrap();
        assert_eq!(envelope.counter, 0);
        assert_eq!(envelope.host, "");
        assert_eq!(envelope.pid, "");

        let neighbor = envelope.neighbor.as_ref().unwrap();
        assert_eq!(neighbor.peer_address, "");
        assert_eq!(neighbor.peer_asn, "");
        assert!(neighbor.message.is_null());
        assert!(matches!(
            envelope.update(),
            Err(ExtractionGap::MissingUpdate)
        ));
    }

    #[test]
    fn test_decode_mandatory_fields() {
        assert!(matches!(
            Envelope::decode(r#"{"type": "update"}"#),
            Err(DecodeError::IncorrectJson(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"time": 1}"#),
            Err(DecodeError::IncorrectJson(_))
        ));
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(DecodeError::IncorrectJson(_))
        ));
        assert!(matches!(Envelope::decode("   "), Err(DecodeError::EmptyLine)));
    }

    #[test]
    fn test_non_update_neighbor_not_decoded() {
        let line = r#"{"time": 1, "type": "state", "neighbor": {"address": {"peer": "10.0.0.1"}, "state": "up"}}"#;
        let envelope = Envelope::decode(line).unwrap();
        assert!(!envelope.is_update());
        assert!(envelope.neighbor.is_none());
    }

    #[test]
    fn test_malformed_update_is_gap() {
        let line = r#"{"time": 1, "type": "update", "neighbor": {"message": {"update": "garbage"}}}"#;
        let envelope = Envelope::decode(line).unwrap();
        assert!(matches!(
            envelope.update(),
            Err(ExtractionGap::MalformedUpdate(_))
        ));
    }
}
