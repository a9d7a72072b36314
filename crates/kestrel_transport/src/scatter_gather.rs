//! The scatter dispatcher: turn a routed sub-request into per-server
//! instance requests and put them on the wire in parallel.
//!
//! Dispatch works replica-group by replica-group: segments are grouped by
//! their candidate server set, the replica policy picks one server per
//! group, and the picks are merged back into one instance request per
//! server before anything is serialized. Task fan-out is therefore
//! proportional to the number of servers contacted, not segments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use kestrel_common::error::{QueryError, QueryResult};
use kestrel_common::metrics::BrokerMetrics;
use kestrel_common::request::BrokerRequest;
use kestrel_common::types::{SegmentIdSet, ServerInstance};

use crate::composite_future::{ChildOutcome, CompositeFuture};
use crate::replica::{ReplicaSelection, ReplicaSelectionGranularity};
use crate::serde::{InstanceRequest, SerDe};
use crate::stats::ScatterGatherStats;

/// The per-server RPC seam. Implementations own connection pooling and
/// wire-level concerns; the dispatcher only hands them framed payloads.
#[async_trait]
pub trait ServerClient: Send + Sync + 'static {
    /// Send one framed instance request and return the server's raw
    /// response payload. Must respect `timeout` as an upper bound.
    async fn query(
        &self,
        server: &ServerInstance,
        payload: Bytes,
        timeout: Duration,
    ) -> QueryResult<Bytes>;
}

/// Everything one scatter call needs.
pub struct ScatterGatherRequest {
    pub broker_request: BrokerRequest,
    /// Candidate servers with the segments each could serve.
    pub segment_services: BTreeMap<ServerInstance, SegmentIdSet>,
    pub replica_selection: Arc<dyn ReplicaSelection>,
    pub granularity: ReplicaSelectionGranularity,
    /// Opaque key feeding hash-based replica policies.
    pub hash_key: Option<String>,
    /// Number of speculative backup requests per server slot; 0 disables.
    pub num_speculative_requests: usize,
    /// How long to wait before firing a speculative backup.
    pub speculative_request_delay_ms: u64,
    pub request_id: u64,
    pub timeout_ms: u64,
    pub broker_id: String,
}

/// One replica group after candidate analysis.
struct ReplicaGroup {
    key: String,
    segments: Vec<String>,
    candidates: Vec<ServerInstance>,
}

/// The scatter dispatcher. Cheap to clone and share across queries.
#[derive(Clone)]
pub struct ScatterGather {
    client: Arc<dyn ServerClient>,
}

impl ScatterGather {
    pub fn new(client: Arc<dyn ServerClient>) -> Self {
        Self { client }
    }

    /// Serialize and dispatch one sub-request to its selected servers.
    ///
    /// Returns a `CompositeFuture` that completes when every per-server
    /// request has terminated or the per-request deadline elapses. The wire
    /// serializer is constructed inside this call and never shared across
    /// concurrent scatters.
    pub fn scatter_gather(
        &self,
        request: &ScatterGatherRequest,
        stats: &mut ScatterGatherStats,
        metrics: &BrokerMetrics,
    ) -> QueryResult<CompositeFuture> {
        let dispatch_start = Instant::now();
        let groups = build_replica_groups(&request.segment_services, request.granularity);

        // Pick one replica per group, then merge the picks per server.
        let mut per_server: BTreeMap<ServerInstance, SegmentIdSet> = BTreeMap::new();
        let mut groups_per_server: BTreeMap<ServerInstance, Vec<usize>> = BTreeMap::new();
        for (index, group) in groups.iter().enumerate() {
            let selected = request
                .replica_selection
                .select_server(&group.key, &group.candidates, request.hash_key.as_deref())
                .ok_or_else(|| {
                    QueryError::Internal(format!(
                        "no candidate server for replica group {}",
                        group.key
                    ))
                })?;
            let segments = per_server.entry(selected.clone()).or_default();
            for segment in &group.segments {
                segments.insert(segment.clone());
            }
            groups_per_server.entry(selected).or_default().push(index);
        }

        let timeout = Duration::from_millis(request.timeout_ms);
        let (tx, rx) = mpsc::channel(per_server.len().max(1) * 2);
        let mut expected_groups = Vec::with_capacity(per_server.len());
        let mut abort_handles = Vec::new();
        let mut serde = SerDe::new();

        for (server, segments) in &per_server {
            let server_id = server.to_string();
            stats.initiate_request(&server_id, segments.len());

            let instance_request = InstanceRequest {
                request_id: request.request_id,
                enable_trace: request.broker_request.enable_trace,
                query: request.broker_request.clone(),
                search_segments: segments.segment_names(),
                broker_id: request.broker_id.clone(),
            };
            let payload = serde.serialize(&instance_request)?;
            stats.set_send_time_ms(&server_id, dispatch_start.elapsed().as_millis() as u64);

            expected_groups.push((server_id.clone(), server.clone()));
            abort_handles.push(self.spawn_query(
                tx.clone(),
                server_id.clone(),
                server.clone(),
                payload.clone(),
                timeout,
                Duration::ZERO,
            ));

            if request.num_speculative_requests > 0 {
                if let Some(backup) = backup_server_for(
                    server,
                    &groups_per_server[server],
                    &groups,
                    request.replica_selection.as_ref(),
                    request.hash_key.as_deref(),
                ) {
                    tracing::debug!(
                        request_id = request.request_id,
                        primary = %server,
                        backup = %backup,
                        "arming speculative backup request"
                    );
                    abort_handles.push(self.spawn_query(
                        tx.clone(),
                        server_id,
                        backup,
                        payload,
                        timeout,
                        Duration::from_millis(request.speculative_request_delay_ms),
                    ));
                }
            }
        }
        drop(tx);

        if expected_groups.is_empty() {
            metrics.meter_exception("empty_scatter");
        }
        Ok(CompositeFuture::new(rx, expected_groups, abort_handles))
    }

    fn spawn_query(
        &self,
        tx: mpsc::Sender<ChildOutcome>,
        group_key: String,
        server: ServerInstance,
        payload: Bytes,
        timeout: Duration,
        delay: Duration,
    ) -> tokio::task::AbortHandle {
        let client = self.client.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let started = Instant::now();
            let result = client.query(&server, payload, timeout).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let _ = tx
                .send(ChildOutcome {
                    group_key,
                    server,
                    result,
                    elapsed_ms,
                })
                .await;
        });
        handle.abort_handle()
    }
}

/// Group segments by candidate server set (or one group per segment).
fn build_replica_groups(
    segment_services: &BTreeMap<ServerInstance, SegmentIdSet>,
    granularity: ReplicaSelectionGranularity,
) -> Vec<ReplicaGroup> {
    let mut candidates_per_segment: BTreeMap<String, BTreeSet<ServerInstance>> = BTreeMap::new();
    for (server, segments) in segment_services {
        for segment in segments.iter() {
            candidates_per_segment
                .entry(segment.clone())
                .or_default()
                .insert(server.clone());
        }
    }

    match granularity {
        ReplicaSelectionGranularity::Segment => candidates_per_segment
            .into_iter()
            .map(|(segment, candidates)| ReplicaGroup {
                key: segment.clone(),
                segments: vec![segment],
                candidates: candidates.into_iter().collect(),
            })
            .collect(),
        ReplicaSelectionGranularity::SegmentIdSet => {
            let mut by_candidate_set: BTreeMap<String, ReplicaGroup> = BTreeMap::new();
            for (segment, candidates) in candidates_per_segment {
                let key = candidates
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                by_candidate_set
                    .entry(key.clone())
                    .or_insert_with(|| ReplicaGroup {
                        key,
                        segments: Vec::new(),
                        candidates: candidates.into_iter().collect(),
                    })
                    .segments
                    .push(segment);
            }
            by_candidate_set.into_values().collect()
        }
    }
}

/// A backup replica able to serve everything the primary was sent: a server
/// that is a candidate for every group the primary won, other than the
/// primary itself.
fn backup_server_for(
    primary: &ServerInstance,
    group_indexes: &[usize],
    groups: &[ReplicaGroup],
    replica_selection: &dyn ReplicaSelection,
    hash_key: Option<&str>,
) -> Option<ServerInstance> {
    let mut common: Option<BTreeSet<ServerInstance>> = None;
    for &index in group_indexes {
        let candidates: BTreeSet<ServerInstance> =
            groups[index].candidates.iter().cloned().collect();
        common = Some(match common {
            None => candidates,
            Some(existing) => existing.intersection(&candidates).cloned().collect(),
        });
    }
    let mut common = common?;
    common.remove(primary);
    if common.is_empty() {
        return None;
    }
    let candidates: Vec<ServerInstance> = common.into_iter().collect();
    replica_selection.select_server(
        &format!("{}#speculative", primary),
        &candidates,
        hash_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::RoundRobinReplicaSelection;
    use kestrel_common::request::Selection;

    /// Client that answers with the server's own id after an optional
    /// per-server delay, and fails for servers in the failing set.
    struct ScriptedClient {
        delays: BTreeMap<String, Duration>,
        failing: BTreeSet<String>,
    }

    #[async_trait]
    impl ServerClient for ScriptedClient {
        async fn query(
            &self,
            server: &ServerInstance,
            _payload: Bytes,
            _timeout: Duration,
        ) -> QueryResult<Bytes> {
            let id = server.to_string();
            if let Some(delay) = self.delays.get(&id) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(&id) {
                return Err(QueryError::BrokerGather(format!("connection refused by {}", id)));
            }
            Ok(Bytes::from(id))
        }
    }

    fn broker_request() -> BrokerRequest {
        BrokerRequest::selection(
            "t_OFFLINE",
            Selection {
                selection_columns: vec!["a".into()],
                size: 10,
                selection_sort_sequence: Vec::new(),
            },
        )
    }

    fn scatter_request(
        segment_services: BTreeMap<ServerInstance, SegmentIdSet>,
    ) -> ScatterGatherRequest {
        ScatterGatherRequest {
            broker_request: broker_request(),
            segment_services,
            replica_selection: Arc::new(RoundRobinReplicaSelection::new()),
            granularity: ReplicaSelectionGranularity::SegmentIdSet,
            hash_key: None,
            num_speculative_requests: 0,
            speculative_request_delay_ms: 0,
            request_id: 1,
            timeout_ms: 1_000,
            broker_id: "broker-test".into(),
        }
    }

    #[tokio::test]
    async fn dispatches_one_request_per_selected_server() {
        let s1 = ServerInstance::new("s1", 8098);
        let s2 = ServerInstance::new("s2", 8098);
        let mut segment_services = BTreeMap::new();
        segment_services.insert(s1.clone(), ["seg0", "seg1"].into_iter().collect());
        segment_services.insert(s2.clone(), ["seg2"].into_iter().collect());

        let dispatcher = ScatterGather::new(Arc::new(ScriptedClient {
            delays: BTreeMap::new(),
            failing: BTreeSet::new(),
        }));
        let mut stats = ScatterGatherStats::new();
        let mut future = dispatcher
            .scatter_gather(&scatter_request(segment_services), &mut stats, &BrokerMetrics::new())
            .unwrap();
        let outcome = future.await_responses(Duration::from_secs(1)).await;

        assert_eq!(outcome.responses.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(stats.entries()["s1_8098"].num_segments, 2);
        assert_eq!(stats.entries()["s2_8098"].num_segments, 1);
    }

    #[tokio::test]
    async fn replicated_segments_go_to_exactly_one_server() {
        // Both servers can serve both segments; only one may be contacted.
        let s1 = ServerInstance::new("s1", 8098);
        let s2 = ServerInstance::new("s2", 8098);
        let segments: SegmentIdSet = ["seg0", "seg1"].into_iter().collect();
        let mut segment_services = BTreeMap::new();
        segment_services.insert(s1.clone(), segments.clone());
        segment_services.insert(s2.clone(), segments);

        let dispatcher = ScatterGather::new(Arc::new(ScriptedClient {
            delays: BTreeMap::new(),
            failing: BTreeSet::new(),
        }));
        let mut stats = ScatterGatherStats::new();
        let mut future = dispatcher
            .scatter_gather(&scatter_request(segment_services), &mut stats, &BrokerMetrics::new())
            .unwrap();
        let outcome = future.await_responses(Duration::from_secs(1)).await;

        assert_eq!(outcome.responses.len(), 1);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn failed_server_surfaces_as_error_alongside_successes() {
        let s1 = ServerInstance::new("s1", 8098);
        let s2 = ServerInstance::new("s2", 8098);
        let mut segment_services = BTreeMap::new();
        segment_services.insert(s1.clone(), ["seg0"].into_iter().collect());
        segment_services.insert(s2.clone(), ["seg1"].into_iter().collect());

        let dispatcher = ScatterGather::new(Arc::new(ScriptedClient {
            delays: BTreeMap::new(),
            failing: ["s2_8098".to_string()].into_iter().collect(),
        }));
        let mut stats = ScatterGatherStats::new();
        let mut future = dispatcher
            .scatter_gather(&scatter_request(segment_services), &mut stats, &BrokerMetrics::new())
            .unwrap();
        let outcome = future.await_responses(Duration::from_secs(1)).await;

        assert_eq!(outcome.responses.len(), 1);
        assert!(outcome.responses.contains_key(&s1));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].0, s2);
    }

    #[tokio::test(start_paused = true)]
    async fn speculative_backup_answers_when_primary_stalls() {
        let s1 = ServerInstance::new("s1", 8098);
        let s2 = ServerInstance::new("s2", 8098);
        let segments: SegmentIdSet = ["seg0"].into_iter().collect();
        let mut segment_services = BTreeMap::new();
        segment_services.insert(s1.clone(), segments.clone());
        segment_services.insert(s2.clone(), segments);

        // Round-robin picks s1 first; s1 stalls past the deadline.
        let mut delays = BTreeMap::new();
        delays.insert("s1_8098".to_string(), Duration::from_secs(60));
        let dispatcher = ScatterGather::new(Arc::new(ScriptedClient {
            delays,
            failing: BTreeSet::new(),
        }));

        let mut request = scatter_request(segment_services);
        request.num_speculative_requests = 1;
        request.speculative_request_delay_ms = 10;

        let mut stats = ScatterGatherStats::new();
        let mut future = dispatcher
            .scatter_gather(&request, &mut stats, &BrokerMetrics::new())
            .unwrap();
        let outcome = future.await_responses(Duration::from_millis(500)).await;

        assert_eq!(outcome.responses.len(), 1);
        let (responder, payload) = outcome.responses.iter().next().unwrap();
        assert_eq!(responder, &s2);
        assert_eq!(payload, &Bytes::from("s2_8098"));
        assert!(outcome.errors.is_empty());
    }
}
