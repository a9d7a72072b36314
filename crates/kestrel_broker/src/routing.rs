//! Routing and time-boundary provider contracts, plus in-memory
//! implementations with atomic snapshot semantics for tests and embedding.
//!
//! Both providers are read on every query and must be safe for concurrent
//! reads. The in-memory implementations keep their state behind an
//! `Arc`-swapped snapshot: readers clone the `Arc` and never observe a
//! half-applied update.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use kestrel_common::error::{QueryError, QueryResult};
use kestrel_common::types::{SegmentIdSet, ServerInstance};

/// One routing lookup: a physical table plus caller-supplied options
/// (parsed from the `routingOptions` debug option).
#[derive(Debug, Clone)]
pub struct RoutingLookupRequest {
    pub table_name: String,
    pub routing_options: Vec<String>,
}

impl RoutingLookupRequest {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            routing_options: Vec::new(),
        }
    }

    pub fn with_options(table_name: impl Into<String>, routing_options: Vec<String>) -> Self {
        Self {
            table_name: table_name.into(),
            routing_options,
        }
    }
}

/// Maps a physical table to the servers owning its segments.
pub trait RoutingTable: Send + Sync {
    /// Whether a routing entry exists for the physical table.
    fn routing_table_exists(&self, table_name: &str) -> bool;

    /// Candidate servers with the segments each could serve. Empty output
    /// is not an error; it simply contributes no work. Repeated lookups
    /// within one request must observe the same snapshot.
    fn find_servers(
        &self,
        request: &RoutingLookupRequest,
    ) -> BTreeMap<ServerInstance, SegmentIdSet>;

    /// Human-readable dump of the routing state for debug endpoints.
    fn dump_snapshot(&self, table_name: Option<&str>) -> QueryResult<String>;
}

/// The time-column split point between a hybrid table's offline and
/// realtime halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBoundaryInfo {
    pub time_column: String,
    pub time_value: String,
}

/// Publishes the time boundary per hybrid table.
pub trait TimeBoundaryService: Send + Sync {
    /// The boundary for an offline physical table, if one is known.
    fn time_boundary_for(&self, offline_table_name: &str) -> Option<TimeBoundaryInfo>;
}

type RoutingSnapshot = HashMap<String, BTreeMap<ServerInstance, SegmentIdSet>>;

/// In-memory routing table with copy-on-write snapshot updates.
#[derive(Default)]
pub struct InMemoryRoutingTable {
    snapshot: RwLock<Arc<RoutingSnapshot>>,
}

impl InMemoryRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the routing entry for one table.
    pub fn set_routing(
        &self,
        table_name: impl Into<String>,
        servers: BTreeMap<ServerInstance, SegmentIdSet>,
    ) {
        let mut guard = self.snapshot.write();
        let mut next = (**guard).clone();
        next.insert(table_name.into(), servers);
        *guard = Arc::new(next);
    }

    pub fn remove_routing(&self, table_name: &str) {
        let mut guard = self.snapshot.write();
        let mut next = (**guard).clone();
        next.remove(table_name);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.read().clone()
    }
}

impl RoutingTable for InMemoryRoutingTable {
    fn routing_table_exists(&self, table_name: &str) -> bool {
        self.snapshot().contains_key(table_name)
    }

    fn find_servers(
        &self,
        request: &RoutingLookupRequest,
    ) -> BTreeMap<ServerInstance, SegmentIdSet> {
        self.snapshot()
            .get(&request.table_name)
            .cloned()
            .unwrap_or_default()
    }

    fn dump_snapshot(&self, table_name: Option<&str>) -> QueryResult<String> {
        let snapshot = self.snapshot();
        let mut dump: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for (table, servers) in snapshot.iter() {
            if let Some(filter) = table_name {
                if table != filter {
                    continue;
                }
            }
            let entry = dump.entry(table.clone()).or_default();
            for (server, segments) in servers {
                entry.insert(server.to_string(), segments.segment_names());
            }
        }
        serde_json::to_string_pretty(&dump)
            .map_err(|e| QueryError::Internal(format!("routing snapshot dump failed: {}", e)))
    }
}

/// In-memory time-boundary provider with the same snapshot discipline.
#[derive(Default)]
pub struct InMemoryTimeBoundaryService {
    boundaries: RwLock<Arc<HashMap<String, TimeBoundaryInfo>>>,
}

impl InMemoryTimeBoundaryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time_boundary(&self, offline_table_name: impl Into<String>, info: TimeBoundaryInfo) {
        let mut guard = self.boundaries.write();
        let mut next = (**guard).clone();
        next.insert(offline_table_name.into(), info);
        *guard = Arc::new(next);
    }
}

impl TimeBoundaryService for InMemoryTimeBoundaryService {
    fn time_boundary_for(&self, offline_table_name: &str) -> Option<TimeBoundaryInfo> {
        self.boundaries.read().get(offline_table_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_configured_servers() {
        let routing = InMemoryRoutingTable::new();
        let server = ServerInstance::new("s1", 8098);
        let mut servers = BTreeMap::new();
        servers.insert(server.clone(), ["seg0"].into_iter().collect::<SegmentIdSet>());
        routing.set_routing("t_OFFLINE", servers);

        assert!(routing.routing_table_exists("t_OFFLINE"));
        assert!(!routing.routing_table_exists("t_REALTIME"));

        let found = routing.find_servers(&RoutingLookupRequest::new("t_OFFLINE"));
        assert_eq!(found.len(), 1);
        assert!(found[&server].contains("seg0"));

        assert!(routing
            .find_servers(&RoutingLookupRequest::new("missing"))
            .is_empty());
    }

    #[test]
    fn dump_snapshot_is_scoped_to_table() {
        let routing = InMemoryRoutingTable::new();
        let mut servers = BTreeMap::new();
        servers.insert(
            ServerInstance::new("s1", 8098),
            ["seg0"].into_iter().collect::<SegmentIdSet>(),
        );
        routing.set_routing("t_OFFLINE", servers.clone());
        routing.set_routing("u_OFFLINE", servers);

        let dump = routing.dump_snapshot(Some("t_OFFLINE")).unwrap();
        assert!(dump.contains("t_OFFLINE"));
        assert!(!dump.contains("u_OFFLINE"));
    }

    #[test]
    fn time_boundary_round_trips() {
        let service = InMemoryTimeBoundaryService::new();
        assert!(service.time_boundary_for("t_OFFLINE").is_none());
        service.set_time_boundary(
            "t_OFFLINE",
            TimeBoundaryInfo {
                time_column: "daysSinceEpoch".into(),
                time_value: "16000".into(),
            },
        );
        let info = service.time_boundary_for("t_OFFLINE").unwrap();
        assert_eq!(info.time_column, "daysSinceEpoch");
        assert_eq!(info.time_value, "16000");
    }
}
