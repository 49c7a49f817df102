use std::{cmp::Ordering, collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

pub type NodeId = u32;

/// Identifies one mesh node: a host (or IPv4 string) plus a small integer id.
///
/// The wire form is the comma-joined pair, e.g. `127.0.0.1,3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    host: String,
    id: NodeId,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, id: NodeId) -> Self {
        Self {
            host: host.into(),
            id,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.host, self.id)
    }
}

impl FromStr for NodeAddress {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| MeshError::InvalidAddress {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let (host, id) = s.split_once(',').ok_or_else(|| invalid("missing ','"))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let id = id
            .trim()
            .parse::<NodeId>()
            .map_err(|_| invalid("id is not a non-negative integer"))?;
        Ok(Self::new(host, id))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(addr: NodeAddress) -> Self {
        addr.to_string()
    }
}

/// Structured entry key used for sharding and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbKey {
    pub a: u64,
    pub b: i64,
    pub c: i64,
}

impl DbKey {
    pub fn new(a: u64, b: i64, c: i64) -> Self {
        Self { a, b, c }
    }
}

/// Key of an entry that has not been assigned one yet.
impl Default for DbKey {
    fn default() -> Self {
        Self {
            a: 1 << 63,
            b: -1,
            c: -1,
        }
    }
}

impl PartialOrd for DbKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DbKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.a.cmp(&other.a) {
            Ordering::Equal => match self.b.cmp(&other.b) {
                Ordering::Equal => self.c.cmp(&other.c),
                b_ord => b_ord,
            },
            a_ord => a_ord,
        }
    }
}

/// The stored unit: a key, a set of tags and an opaque value.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entry {
    pub key: DbKey,
    pub tags: BTreeSet<String>,
    pub value: String,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("tags", &self.tags)
            .field("value_len", &self.value.len())
            .finish()
    }
}

impl Entry {
    pub fn new(key: DbKey, value: impl Into<String>) -> Self {
        Self {
            key,
            tags: BTreeSet::new(),
            value: value.into(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    /// Append one line to the value.
    pub fn add_to_value(&mut self, line: &str) {
        self.value.push_str(line);
        self.value.push('\n');
    }

    /// True when every queried tag is present. An empty query matches nothing.
    pub fn matches<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        !tags.is_empty() && tags.iter().all(|t| self.tags.contains(t.as_ref()))
    }
}
