use crate::models::de::lenient;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::marker::PhantomData;

/// BGP community value as `(asn, value)`.
pub type Community = (u32, u32);

/// The `message.update` payload of an ExaBGP neighbor message.
///
/// ```json
/// "update": {
///     "attribute": { "origin": "igp", "as-path": [ 200020, 3333 ], "community": [ [ 65432, 3000 ] ] },
///     "announce": { "ipv4 unicast": { "172.30.4.1": [ { "nlri": "193.0.20.0/23" } ] } },
///     "withdraw": { "ipv4 unicast": [ { "nlri": "212.114.112.196/32" } ] }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    #[serde(default, deserialize_with = "lenient")]
    pub attribute: Option<Attributes>,
    /// address family -> next-hop -> announced prefixes
    #[serde(default)]
    pub announce: Option<OrderedMap<OrderedMap<Vec<Nlri>>>>,
    /// address family -> withdrawn prefixes
    #[serde(default)]
    pub withdraw: Option<OrderedMap<Vec<Nlri>>>,
}

/// Path attributes of an update. A missing or malformed attribute is `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attributes {
    #[serde(default, deserialize_with = "lenient")]
    pub origin: Option<String>,
    #[serde(default, rename = "as-path", deserialize_with = "lenient")]
    pub as_path: Option<Vec<u32>>,
    #[serde(default, rename = "confederation-path", deserialize_with = "lenient")]
    pub confederation_path: Option<Vec<u32>>,
    #[serde(default, deserialize_with = "lenient")]
    pub med: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub community: Option<Vec<Community>>,
}

/// One prefix entry. ExaBGP writes `{ "nlri": "10.0.0.0/8" }`; older encoders write the bare string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "NlriEntry")]
pub struct Nlri(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum NlriEntry {
    Object { nlri: String },
    Bare(String),
}

impl From<NlriEntry> for Nlri {
    fn from(entry: NlriEntry) -> Self {
        match entry {
            NlriEntry::Object { nlri } => Nlri(nlri),
            NlriEntry::Bare(nlri) => Nlri(nlri),
        }
    }
}

impl Nlri {
    pub fn prefix(&self) -> &str {
        self.0.as_str()
    }
}

/// JSON object decoded into key/value pairs, keeping the producer's key order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, T> Deserialize<'de> for OrderedMap<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedMapVisitor<T>(PhantomData<T>);

        impl<'de, T> Visitor<'de> for OrderedMapVisitor<T>
        where
            T: Deserialize<'de>,
        {
            type Value = OrderedMap<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}
