//! Prefix-list messages exchanged between consumers of the prefix events.
//!
//! A consumer tracking [PrefixMessage]s can publish its current list of
//! prefixes, periodically or in answer to a [PrefixListRequestMessage].
//! Under a topic root of `prefix` the list travels on `prefixlist/update`
//! (unsolicited) or `prefixlist/requested` (answer), requests on
//! `prefixlist/request`.

use crate::models::{PrefixAction, PrefixMessage};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

fn list_topic(root: &str, leaf: &str) -> String {
    format!("{}list/{}", root.trim_end_matches('/'), leaf)
}

/// The current list of advertised prefixes.
///
/// ```json
/// {"list": [{"asn": "200020", "prefix": "193.0.20.0/23", ...}], "requested": false}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixListMessage {
    pub list: Vec<PrefixMessage>,
    /// true when sent in answer to a [PrefixListRequestMessage]
    pub requested: bool,
}

impl PrefixListMessage {
    pub fn new(list: Vec<PrefixMessage>, requested: bool) -> Self {
        PrefixListMessage { list, requested }
    }

    pub fn add_prefix(&mut self, prefix: PrefixMessage) {
        self.list.push(prefix);
    }

    /// `<root>list/requested` for answers, `<root>list/update` otherwise.
    pub fn topic(&self, root: &str) -> String {
        match self.requested {
            true => list_topic(root, "requested"),
            false => list_topic(root, "update"),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Ask the holder of the prefix list to publish it, as a requested [PrefixListMessage].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixListRequestMessage {
    pub request: bool,
}

impl Default for PrefixListRequestMessage {
    fn default() -> Self {
        PrefixListRequestMessage { request: true }
    }
}

impl PrefixListRequestMessage {
    pub fn topic(root: &str) -> String {
        list_topic(root, "request")
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// The kinds of message carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Prefix,
    PrefixList,
    PrefixListRequest,
}

impl MessageKind {
    /// Every topic a message of this kind is published on.
    pub fn topics(&self, root: &str) -> Vec<String> {
        let root = root.trim_end_matches('/');
        match self {
            MessageKind::Prefix => [PrefixAction::Announce, PrefixAction::Withdraw]
                .iter()
                .map(|action| format!("{}/{}", root, action))
                .collect(),
            MessageKind::PrefixList => vec![list_topic(root, "update"), list_topic(root, "requested")],
            MessageKind::PrefixListRequest => vec![PrefixListRequestMessage::topic(root)],
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<BusMessage, serde_json::Error> {
        Ok(match self {
            MessageKind::Prefix => BusMessage::Prefix(PrefixMessage::decode(payload)?),
            MessageKind::PrefixList => BusMessage::PrefixList(PrefixListMessage::decode(payload)?),
            MessageKind::PrefixListRequest => {
                BusMessage::PrefixListRequest(PrefixListRequestMessage::decode(payload)?)
            }
        })
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Prefix => write!(f, "prefix"),
            MessageKind::PrefixList => write!(f, "prefix list"),
            MessageKind::PrefixListRequest => write!(f, "prefix list request"),
        }
    }
}

/// A decoded bus message of any [MessageKind]; serializes as the bare message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusMessage {
    Prefix(PrefixMessage),
    PrefixList(PrefixListMessage),
    PrefixListRequest(PrefixListRequestMessage),
}
