use crate::models::Community;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Whether a prefix was announced or withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixAction {
    Announce,
    Withdraw,
}

impl PrefixAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefixAction::Announce => "announce",
            PrefixAction::Withdraw => "withdraw",
        }
    }
}

impl Display for PrefixAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One announced or withdrawn prefix, derived from an ExaBGP update.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefixEvent {
    /// producer timestamp of the update, seconds since epoch
    pub timestamp: f64,
    /// reported origin ASN, `"I"` when the path has at most one hop, empty when unknown
    pub origin_asn: String,
    pub prefix: String,
    /// next-hop address, empty for withdrawals
    pub next_hop: String,
    pub is_announce: bool,
    pub as_path: Vec<u32>,
    pub community: Vec<Community>,
}

impl PrefixEvent {
    pub fn action(&self) -> PrefixAction {
        match self.is_announce {
            true => PrefixAction::Announce,
            false => PrefixAction::Withdraw,
        }
    }

    /// Wire representation of this event.
    pub fn to_message(&self) -> PrefixMessage {
        PrefixMessage {
            asn: self.origin_asn.clone(),
            prefix: self.prefix.clone(),
            nexthop: self.next_hop.clone(),
            action: Some(self.action()),
            as_path: self.as_path.clone(),
            community: self.community.clone(),
        }
    }
}

/// The JSON record published to the message bus for each [PrefixEvent].
///
/// ```json
/// {"asn": "200020", "prefix": "193.0.20.0/23", "nexthop": "172.30.4.1", "type": "announce",
///  "as_path": [200020, 3333], "community": [[65432, 3000]]}
/// ```
///
/// Decoding is forgiving: any absent field decodes to an empty value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixMessage {
    pub asn: String,
    pub prefix: String,
    pub nexthop: String,
    #[serde(rename = "type")]
    pub action: Option<PrefixAction>,
    pub as_path: Vec<u32>,
    pub community: Vec<Community>,
}

impl PrefixMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
