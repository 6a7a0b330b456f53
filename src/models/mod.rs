//! Data model for ExaBGP monitoring input and the normalized events derived from it.
//!
//! - [Envelope] and [NeighborContext]: one decoded line of ExaBGP JSON output
//! - [Update]: the `message.update` payload of a neighbor
//! - [PrefixEvent] and [PrefixMessage]: one announced or withdrawn prefix, and its wire form
//! - [PrefixListMessage] and [PrefixListRequestMessage]: prefix lists exchanged between consumers

mod de;
mod envelope;
mod event;
mod prefix_list;
mod update;

pub use envelope::{Envelope, NeighborContext, UPDATE_KIND};
pub use event::{PrefixAction, PrefixEvent, PrefixMessage};
pub use prefix_list::{BusMessage, MessageKind, PrefixListMessage, PrefixListRequestMessage};
pub use update::{Attributes, Community, Nlri, OrderedMap, Update};
