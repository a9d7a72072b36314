//! Core identity types: servers, segment sets, and physical table naming.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix separating a logical table name from its physical variants.
const OFFLINE_SUFFIX: &str = "_OFFLINE";
const REALTIME_SUFFIX: &str = "_REALTIME";

/// The two physical table variants backing one logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableType {
    Offline,
    Realtime,
}

impl TableType {
    pub fn suffix(&self) -> &'static str {
        match self {
            TableType::Offline => OFFLINE_SUFFIX,
            TableType::Realtime => REALTIME_SUFFIX,
        }
    }

    /// Physical table name for a logical table, e.g. `myTable` -> `myTable_OFFLINE`.
    pub fn table_name_for(&self, logical_name: &str) -> String {
        // Already-suffixed names pass through unchanged.
        if logical_name.ends_with(self.suffix()) {
            return logical_name.to_string();
        }
        format!("{}{}", logical_name, self.suffix())
    }

    /// The variant a physical table name belongs to, if any.
    pub fn from_table_name(table_name: &str) -> Option<TableType> {
        if table_name.ends_with(OFFLINE_SUFFIX) {
            Some(TableType::Offline)
        } else if table_name.ends_with(REALTIME_SUFFIX) {
            Some(TableType::Realtime)
        } else {
            None
        }
    }
}

/// Identity of one server response slot.
///
/// `sequence` disambiguates two responses from the same physical server in a
/// federated query (one for the offline sub-request, one for realtime); it is
/// 0 for non-federated responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerInstance {
    pub hostname: String,
    pub port: u16,
    pub sequence: u32,
}

impl ServerInstance {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            sequence: 0,
        }
    }

    /// The same physical server with a different response sequence.
    pub fn with_sequence(&self, sequence: u32) -> Self {
        Self {
            hostname: self.hostname.clone(),
            port: self.port,
            sequence,
        }
    }
}

impl fmt::Display for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sequence == 0 {
            write!(f, "{}_{}", self.hostname, self.port)
        } else {
            write!(f, "{}_{}_{}", self.hostname, self.port, self.sequence)
        }
    }
}

/// An unordered set of segment names belonging to one server.
///
/// Backed by a `BTreeSet` so iteration order is deterministic, which keeps
/// serialized requests and test assertions stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIdSet {
    segments: BTreeSet<String>,
}

impl SegmentIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, segment: impl Into<String>) {
        self.segments.insert(segment.into());
    }

    pub fn extend(&mut self, other: &SegmentIdSet) {
        self.segments
            .extend(other.segments.iter().cloned());
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.segments.contains(segment)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.segments.iter()
    }

    /// Segment names as a list, in deterministic order.
    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().cloned().collect()
    }
}

impl FromIterator<String> for SegmentIdSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a str> for SegmentIdSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self {
            segments: iter.into_iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_table_names() {
        assert_eq!(TableType::Offline.table_name_for("t"), "t_OFFLINE");
        assert_eq!(TableType::Realtime.table_name_for("t"), "t_REALTIME");
        assert_eq!(TableType::Offline.table_name_for("t_OFFLINE"), "t_OFFLINE");
        assert_eq!(
            TableType::from_table_name("t_REALTIME"),
            Some(TableType::Realtime)
        );
        assert_eq!(TableType::from_table_name("t"), None);
    }

    #[test]
    fn server_instance_display_includes_sequence() {
        let server = ServerInstance::new("host1", 8098);
        assert_eq!(server.to_string(), "host1_8098");
        assert_eq!(server.with_sequence(1).to_string(), "host1_8098_1");
    }

    #[test]
    fn segment_id_set_is_deterministic() {
        let set: SegmentIdSet = ["seg2", "seg0", "seg1"].into_iter().collect();
        assert_eq!(set.segment_names(), vec!["seg0", "seg1", "seg2"]);
    }
}
