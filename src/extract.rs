//! Derive BGP routing changes from an ExaBGP [Update].
//!
//! The resolvers are pure and never fail: missing attributes yield empty values.

use crate::models::{Community, PrefixEvent, Update};

/// Reported origin ASN when the AS path has at most one hop.
pub const DIRECT_ORIGIN: &str = "I";

/// Origin ASN and AS path of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    pub asn: String,
    pub as_path: Vec<u32>,
}

/// Resolve the reported origin ASN from `attribute.as-path`.
///
/// The second path element is reported, not the first. A path of zero or one
/// element reports [DIRECT_ORIGIN]. Without a usable path both values are empty.
pub fn resolve_origin(update: &Update) -> Origin {
    let Some(as_path) = update
        .attribute
        .as_ref()
        .and_then(|attribute| attribute.as_path.as_ref())
    else {
        return Origin::default();
    };

    let asn = match as_path.get(1) {
        Some(asn) => asn.to_string(),
        None => DIRECT_ORIGIN.to_string(),
    };

    Origin {
        asn,
        as_path: as_path.clone(),
    }
}

pub fn resolve_community(update: &Update) -> Vec<Community> {
    update
        .attribute
        .as_ref()
        .and_then(|attribute| attribute.community.clone())
        .unwrap_or_default()
}

/// Flatten `announce` into `(next_hop, prefix)` pairs, in producer order.
///
/// Returns `None` when the update has no `announce` block.
pub fn expand_announcements(update: &Update) -> Option<Vec<(String, String)>> {
    let announce = update.announce.as_ref()?;
    Some(
        announce
            .iter()
            .flat_map(|(_family, next_hops)| next_hops.iter())
            .flat_map(|(next_hop, nlris)| {
                nlris
                    .iter()
                    .map(move |nlri| (next_hop.to_string(), nlri.prefix().to_string()))
            })
            .collect(),
    )
}

/// Flatten `withdraw` into prefixes, in producer order.
///
/// Returns `None` when the update has no `withdraw` block.
pub fn expand_withdrawals(update: &Update) -> Option<Vec<String>> {
    let withdraw = update.withdraw.as_ref()?;
    Some(
        withdraw
            .iter()
            .flat_map(|(_family, nlris)| nlris.iter())
            .map(|nlri| nlri.prefix().to_string())
            .collect(),
    )
}

/// Build the prefix events of one update.
///
/// An update carrying both blocks is treated as an announcement only; one
/// carrying neither yields no events.
pub fn derive_events(timestamp: f64, update: &Update) -> Vec<PrefixEvent> {
    let origin = resolve_origin(update);
    let community = resolve_community(update);

    let event = |prefix: String, next_hop: String, is_announce: bool| PrefixEvent {
        timestamp,
        origin_asn: origin.asn.clone(),
        prefix,
        next_hop,
        is_announce,
        as_path: origin.as_path.clone(),
        community: community.clone(),
    };

    if let Some(announcements) = expand_announcements(update) {
        announcements
            .into_iter()
            .map(|(next_hop, prefix)| event(prefix, next_hop, true))
            .collect()
    } else if let Some(withdrawals) = expand_withdrawals(update) {
        withdrawals
            .into_iter()
            .map(|prefix| event(prefix, String::new(), false))
            .collect()
    } else {
        vec![]
    }
}
