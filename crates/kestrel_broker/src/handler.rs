//! The broker request handler: one instance serves all inbound queries
//! concurrently.
//!
//! Lifecycle per query: compile, validate, match physical tables, split
//! hybrid requests on the time boundary, route each sub-request, scatter,
//! gather, deserialize, reduce. Compile and validate failures short-circuit
//! with a well-formed response; every later failure is scoped to a shard
//! and collected into the response's exception list.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use kestrel_common::config::BrokerConfig;
use kestrel_common::datatable::DataTable;
use kestrel_common::error::{ProcessingException, QueryError, QueryResult};
use kestrel_common::metrics::{BrokerMetrics, QueryPhase};
use kestrel_common::request::{BrokerRequest, FilterOperator, FilterQuery};
use kestrel_common::response::BrokerResponse;
use kestrel_common::types::{SegmentIdSet, ServerInstance, TableType};
use kestrel_transport::{
    ReplicaSelection, ReplicaSelectionGranularity, RoundRobinReplicaSelection, ScatterGather,
    ScatterGatherRequest, ScatterGatherStats,
};

use crate::optimizer::BrokerRequestOptimizer;
use crate::reduce::ReduceServiceRegistry;
use crate::routing::{RoutingLookupRequest, RoutingTable, TimeBoundaryService};

/// Reserved ids for broker-synthesized filter nodes. Negative so they can
/// never collide with parser-generated ids.
const TIME_FILTER_ID: i32 = -1;
const TIME_AND_FILTER_ID: i32 = -2;

/// Debug option carrying comma-separated routing options.
const ROUTING_OPTIONS_KEY: &str = "routingOptions";

/// The query-language compiler, an external collaborator producing the
/// structured request tree.
pub trait RequestCompiler: Send + Sync {
    fn compile(&self, pql: &str) -> QueryResult<BrokerRequest>;
}

/// Thread-safe broker request handler; clients submit queries concurrently.
pub struct BrokerRequestHandler {
    routing_table: Arc<dyn RoutingTable>,
    time_boundary_service: Arc<dyn TimeBoundaryService>,
    scatter_gatherer: ScatterGather,
    reduce_registry: ReduceServiceRegistry,
    compiler: Arc<dyn RequestCompiler>,
    metrics: BrokerMetrics,
    optimizer: BrokerRequestOptimizer,
    replica_selection: Arc<dyn ReplicaSelection>,
    query_response_limit: i64,
    timeout_ms: u64,
    broker_id: String,
    num_speculative_requests: usize,
    speculative_request_delay_ms: u64,
    request_id_generator: AtomicU64,
}

impl BrokerRequestHandler {
    pub fn new(
        routing_table: Arc<dyn RoutingTable>,
        time_boundary_service: Arc<dyn TimeBoundaryService>,
        scatter_gatherer: ScatterGather,
        compiler: Arc<dyn RequestCompiler>,
        metrics: BrokerMetrics,
        config: &BrokerConfig,
    ) -> Self {
        info!(
            query_response_limit = config.query_response_limit,
            timeout_ms = config.timeout_ms,
            broker_id = %config.broker_id,
            "broker request handler ready"
        );
        Self {
            routing_table,
            time_boundary_service,
            scatter_gatherer,
            reduce_registry: ReduceServiceRegistry::new(),
            compiler,
            metrics,
            optimizer: BrokerRequestOptimizer::new(),
            replica_selection: Arc::new(RoundRobinReplicaSelection::new()),
            query_response_limit: config.query_response_limit,
            timeout_ms: config.timeout_ms,
            broker_id: config.broker_id.clone(),
            num_speculative_requests: 0,
            speculative_request_delay_ms: config.timeout_ms / 2,
            request_id_generator: AtomicU64::new(0),
        }
    }

    /// Use a different replica selection policy.
    pub fn with_replica_selection(mut self, replica_selection: Arc<dyn ReplicaSelection>) -> Self {
        self.replica_selection = replica_selection;
        self
    }

    /// Arm speculative backup requests after the given delay.
    pub fn with_speculative_requests(mut self, count: usize, delay_ms: u64) -> Self {
        self.num_speculative_requests = count;
        self.speculative_request_delay_ms = delay_ms;
        self
    }

    /// Process one JSON query request:
    /// `{"pql": ..., "trace": "true"|"false", "debugOptions": "k1=v1;k2=v2"}`.
    pub async fn handle_request(&self, request: &JsonValue) -> BrokerResponse {
        let compilation_start = Instant::now();
        let request_id = self.request_id_generator.fetch_add(1, Ordering::Relaxed) + 1;

        let pql = match request.get("pql").and_then(JsonValue::as_str) {
            Some(pql) => pql,
            None => {
                self.metrics.meter_exception("json_parsing");
                return BrokerResponse::from_error(&QueryError::JsonParsing(
                    "request is missing the pql field".to_string(),
                ));
            }
        };
        debug!(request_id, pql, "query received");

        let trace_enabled = request
            .get("trace")
            .and_then(JsonValue::as_str)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let debug_options = request
            .get("debugOptions")
            .and_then(JsonValue::as_str)
            .map(parse_debug_options)
            .unwrap_or_default();

        // Compile and validate; both failures return synchronously.
        let mut broker_request = match self.compiler.compile(pql) {
            Ok(broker_request) => broker_request,
            Err(e) => {
                warn!(request_id, pql, error = %e, "compilation failed");
                self.metrics.meter_exception("request_compilation");
                return BrokerResponse::from_error(&e);
            }
        };
        if let Err(e) = self.validate_request(&broker_request) {
            warn!(request_id, pql, error = %e, "validation failed");
            self.metrics.meter_exception(e.kind());
            return BrokerResponse::from_error(&e);
        }
        broker_request.enable_trace = trace_enabled;
        broker_request.debug_options = debug_options;

        let table_name = broker_request.query_source.table_name.clone();
        self.metrics.add_phase_timing(
            &table_name,
            QueryPhase::RequestCompilation,
            compilation_start.elapsed(),
        );
        self.metrics.meter_query(&table_name);

        let execution_start = Instant::now();
        let mut stats = ScatterGatherStats::new();
        let mut response = self
            .process_broker_request(broker_request, &mut stats, request_id)
            .await;
        self.metrics.add_phase_timing(
            &table_name,
            QueryPhase::QueryExecution,
            execution_start.elapsed(),
        );

        // Total time covers compilation, scatter/gather, ser/de and reduce.
        response.time_used_ms = compilation_start.elapsed().as_millis() as u64;
        info!(
            request_id,
            table = %table_name,
            time_used_ms = response.time_used_ms,
            num_docs_scanned = response.num_docs_scanned,
            num_entries_scanned_in_filter = response.num_entries_scanned_in_filter,
            num_entries_scanned_post_filter = response.num_entries_scanned_post_filter,
            total_docs = response.total_docs,
            num_exceptions = response.exceptions.len(),
            scatter_gather_stats = %stats,
            "query served"
        );
        response
    }

    /// Broker-side validation: group-by TOP and selection LIMIT must not
    /// exceed the configured response limit.
    pub fn validate_request(&self, request: &BrokerRequest) -> QueryResult<()> {
        if request.has_aggregations() {
            if let Some(group_by) = &request.group_by {
                if group_by.top_n > self.query_response_limit {
                    return Err(QueryError::QueryValidation(format!(
                        "value for TOP {} exceeded maximum allowed value of {}",
                        group_by.top_n, self.query_response_limit
                    )));
                }
            }
        } else if let Some(selection) = &request.selections {
            if selection.size > self.query_response_limit {
                return Err(QueryError::QueryValidation(format!(
                    "value for LIMIT {} exceeded maximum allowed value of {}",
                    selection.size, self.query_response_limit
                )));
            }
        }
        Ok(())
    }

    /// Route, scatter, gather, deserialize and reduce one compiled request.
    pub async fn process_broker_request(
        &self,
        broker_request: BrokerRequest,
        stats: &mut ScatterGatherStats,
        request_id: u64,
    ) -> BrokerResponse {
        let logical_table = broker_request.query_source.table_name.clone();
        let matched_tables = self.matched_tables(&logical_table);
        match matched_tables.len() {
            0 => {
                warn!(request_id, table = %logical_table, "no table matched");
                BrokerResponse::no_table_hit()
            }
            1 => {
                let mut request = broker_request;
                request.query_source.table_name = matched_tables.into_iter().next()
                    .unwrap_or(logical_table);
                let optimized = self.optimizer.optimize(request);
                let reduce_request = optimized.clone();
                self.process_table_requests(&reduce_request, vec![optimized], stats, request_id)
                    .await
            }
            _ => {
                // Hybrid table: split into offline and realtime sub-requests
                // stitched at the time boundary.
                let per_table_requests = vec![
                    self.offline_request(&broker_request),
                    self.realtime_request(&broker_request),
                ];
                self.process_table_requests(&broker_request, per_table_requests, stats, request_id)
                    .await
            }
        }
    }

    async fn process_table_requests(
        &self,
        reduce_request: &BrokerRequest,
        per_table_requests: Vec<BrokerRequest>,
        stats: &mut ScatterGatherStats,
        request_id: u64,
    ) -> BrokerResponse {
        let table_name = reduce_request.query_source.table_name.clone();
        let federated = per_table_requests.len() > 1;
        let mut processing_exceptions: Vec<ProcessingException> = Vec::new();

        // Route and scatter every sub-request before gathering any of them,
        // so offline and realtime shards run concurrently.
        let mut routing_time = Duration::ZERO;
        let mut scatter_gather_time = Duration::ZERO;
        let mut composite_futures = Vec::new();
        for request in per_table_requests {
            let sub_table = request.query_source.table_name.clone();

            let routing_start = Instant::now();
            let segment_services = self.find_candidate_servers(&request);
            routing_time += routing_start.elapsed();
            if segment_services.is_empty() {
                warn!(request_id, table = %sub_table, "no server found for table");
                continue;
            }
            debug!(
                request_id,
                table = %sub_table,
                num_servers = segment_services.len(),
                "routed"
            );

            let scatter_start = Instant::now();
            let scatter_request = ScatterGatherRequest {
                hash_key: request.bucket_hash_key.clone(),
                broker_request: request,
                segment_services,
                replica_selection: self.replica_selection.clone(),
                granularity: ReplicaSelectionGranularity::SegmentIdSet,
                num_speculative_requests: self.num_speculative_requests,
                speculative_request_delay_ms: self.speculative_request_delay_ms,
                request_id,
                timeout_ms: self.timeout_ms,
                broker_id: self.broker_id.clone(),
            };
            match self
                .scatter_gatherer
                .scatter_gather(&scatter_request, stats, &self.metrics)
            {
                Ok(future) => composite_futures.push(future),
                Err(e) => {
                    error!(request_id, table = %sub_table, error = %e, "scatter failed");
                    self.metrics.meter_exception(e.kind());
                    processing_exceptions.push(e.into());
                }
            }
            scatter_gather_time += scatter_start.elapsed();
        }
        if composite_futures.is_empty() {
            return if processing_exceptions.is_empty() {
                BrokerResponse::empty()
            } else {
                BrokerResponse::with_exceptions(processing_exceptions)
            };
        }
        self.metrics
            .add_phase_timing(&table_name, QueryPhase::QueryRouting, routing_time);

        // Gather: wait on each composite future up to the deadline. Shards
        // that fail or miss the deadline become gather errors; the query
        // never fails solely because a subset of shards did.
        let gather_start = Instant::now();
        let timeout = Duration::from_millis(self.timeout_ms);
        let mut response_maps = Vec::with_capacity(composite_futures.len());
        for mut future in composite_futures {
            let outcome = future.await_responses(timeout).await;
            stats.set_response_times_ms(future.response_times_ms());
            for (server, gather_error) in outcome.errors {
                error!(request_id, server = %server, error = %gather_error, "shard lost in gather");
                self.metrics.meter_exception(gather_error.kind());
                processing_exceptions.push(gather_error.into());
            }
            response_maps.push(outcome.responses);
        }
        scatter_gather_time += gather_start.elapsed();
        self.metrics.add_phase_timing(
            &table_name,
            QueryPhase::ScatterGather,
            scatter_gather_time,
        );

        // Deserialize; in federated mode re-stamp the server identity with
        // the sub-request index so offline and realtime responses from one
        // physical server stay distinguishable in the reduce map.
        let deserialization_start = Instant::now();
        let mut data_tables: BTreeMap<ServerInstance, DataTable> = BTreeMap::new();
        for (sequence, response_map) in response_maps.into_iter().enumerate() {
            self.deserialize_responses(
                response_map,
                federated.then_some(sequence as u32),
                &mut data_tables,
                &mut processing_exceptions,
            );
        }
        self.metrics.add_phase_timing(
            &table_name,
            QueryPhase::Deserialization,
            deserialization_start.elapsed(),
        );

        // Reduce.
        let reduce_start = Instant::now();
        let reduce_service = self.reduce_registry.get(reduce_request.response_format);
        let mut response = reduce_service.reduce_on_data_table(reduce_request, data_tables);
        self.metrics
            .add_docs_scanned(&table_name, response.num_docs_scanned);
        self.metrics
            .add_phase_timing(&table_name, QueryPhase::Reduce, reduce_start.elapsed());

        response.exceptions.extend(processing_exceptions);
        response
    }

    /// Physical tables matched by a logical name: the `_OFFLINE` and
    /// `_REALTIME` variants that exist in the routing table, falling back
    /// to the raw name.
    fn matched_tables(&self, table_name: &str) -> Vec<String> {
        let mut matched = Vec::new();
        let offline = TableType::Offline.table_name_for(table_name);
        if self.routing_table.routing_table_exists(&offline) {
            matched.push(offline);
        }
        let realtime = TableType::Realtime.table_name_for(table_name);
        if self.routing_table.routing_table_exists(&realtime) {
            matched.push(realtime);
        }
        if matched.is_empty() && self.routing_table.routing_table_exists(table_name) {
            matched.push(table_name.to_string());
        }
        matched
    }

    fn offline_request(&self, broker_request: &BrokerRequest) -> BrokerRequest {
        let hybrid_table = &broker_request.query_source.table_name;
        let mut request = broker_request.clone();
        request.query_source.table_name = TableType::Offline.table_name_for(hybrid_table);
        self.attach_time_boundary(hybrid_table, &mut request, true);
        self.optimizer.optimize(request)
    }

    fn realtime_request(&self, broker_request: &BrokerRequest) -> BrokerRequest {
        let hybrid_table = &broker_request.query_source.table_name;
        let mut request = broker_request.clone();
        request.query_source.table_name = TableType::Realtime.table_name_for(hybrid_table);
        self.attach_time_boundary(hybrid_table, &mut request, false);
        self.optimizer.optimize(request)
    }

    /// AND a time-boundary range filter into a hybrid sub-request so the
    /// offline and realtime halves cannot both count a row at the boundary:
    /// offline keeps `(*, value)`, realtime keeps `[value, *)`.
    ///
    /// Without a published boundary the sub-queries may overlap; that is
    /// accepted degradation, logged but not surfaced as an exception.
    fn attach_time_boundary(
        &self,
        hybrid_table: &str,
        request: &mut BrokerRequest,
        is_offline_request: bool,
    ) {
        let offline_table = TableType::Offline.table_name_for(hybrid_table);
        let boundary = match self.time_boundary_service.time_boundary_for(&offline_table) {
            Some(boundary) => boundary,
            None => {
                warn!(table = %hybrid_table, "no time boundary attached for hybrid table");
                return;
            }
        };

        let range_literal = if is_offline_request {
            format!("(*\t\t{})", boundary.time_value)
        } else {
            format!("[{}\t\t*)", boundary.time_value)
        };
        let time_filter = FilterQuery::leaf(
            TIME_FILTER_ID,
            FilterOperator::Range,
            boundary.time_column,
            vec![range_literal],
        );

        match request.root_filter_id {
            Some(current_root) => {
                let and_filter = FilterQuery::composite(
                    TIME_AND_FILTER_ID,
                    FilterOperator::And,
                    vec![current_root, TIME_FILTER_ID],
                );
                request.filter_sub_query_map.put(time_filter);
                request.filter_sub_query_map.put(and_filter);
                request.root_filter_id = Some(TIME_AND_FILTER_ID);
            }
            None => {
                request.filter_sub_query_map.put(time_filter);
                request.root_filter_id = Some(TIME_FILTER_ID);
            }
        }
    }

    /// Ask the routing provider for the candidate servers of one
    /// sub-request, honoring the `routingOptions` debug option.
    fn find_candidate_servers(
        &self,
        request: &BrokerRequest,
    ) -> BTreeMap<ServerInstance, SegmentIdSet> {
        let routing_options: Vec<String> = request
            .debug_options
            .get(ROUTING_OPTIONS_KEY)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|option| !option.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let lookup = RoutingLookupRequest::with_options(
            request.query_source.table_name.clone(),
            routing_options,
        );
        self.routing_table.find_servers(&lookup)
    }

    fn deserialize_responses(
        &self,
        responses: HashMap<ServerInstance, Bytes>,
        sequence: Option<u32>,
        data_tables: &mut BTreeMap<ServerInstance, DataTable>,
        processing_exceptions: &mut Vec<ProcessingException>,
    ) {
        for (server, bytes) in responses {
            let server = match sequence {
                Some(sequence) => server.with_sequence(sequence),
                None => server,
            };
            match DataTable::from_bytes(&bytes) {
                Ok(table) => {
                    data_tables.insert(server, table);
                }
                Err(e) => {
                    error!(server = %server, error = %e, "failed to deserialize server response");
                    self.metrics.meter_exception(e.kind());
                    processing_exceptions.push(e.into());
                }
            }
        }
    }

    /// Debug view of the routing state for one table.
    pub fn routing_table_snapshot(&self, table_name: &str) -> QueryResult<String> {
        self.routing_table.dump_snapshot(Some(table_name))
    }
}

fn parse_debug_options(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
