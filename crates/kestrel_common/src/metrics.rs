//! Broker metrics over the `metrics` facade.
//!
//! Recording is safe without an installed exporter (the facade no-ops), so
//! library users only pay for what they wire up.

use std::time::Duration;

/// Pipeline phases with individually tracked timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    RequestCompilation,
    QueryRouting,
    ScatterGather,
    Deserialization,
    Reduce,
    QueryExecution,
}

impl QueryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPhase::RequestCompilation => "request_compilation",
            QueryPhase::QueryRouting => "query_routing",
            QueryPhase::ScatterGather => "scatter_gather",
            QueryPhase::Deserialization => "deserialization",
            QueryPhase::Reduce => "reduce",
            QueryPhase::QueryExecution => "query_execution",
        }
    }
}

/// The broker's metrics sink. Cheap to clone; safe for concurrent use.
#[derive(Debug, Clone, Default)]
pub struct BrokerMetrics;

impl BrokerMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Record the wall-clock duration of one pipeline phase.
    pub fn add_phase_timing(&self, table: &str, phase: QueryPhase, duration: Duration) {
        metrics::histogram!(
            "kestrel_broker_phase_duration_us",
            "table" => table.to_string(),
            "phase" => phase.as_str(),
        )
        .record(duration.as_micros() as f64);
    }

    /// Count one processed query against a table.
    pub fn meter_query(&self, table: &str) {
        metrics::counter!(
            "kestrel_broker_queries_total",
            "table" => table.to_string(),
        )
        .increment(1);
    }

    /// Count one exception of the given kind.
    pub fn meter_exception(&self, kind: &'static str) {
        metrics::counter!(
            "kestrel_broker_exceptions_total",
            "kind" => kind,
        )
        .increment(1);
    }

    /// Add to the documents-scanned meter after reduce.
    pub fn add_docs_scanned(&self, table: &str, num_docs: u64) {
        metrics::counter!(
            "kestrel_broker_documents_scanned_total",
            "table" => table.to_string(),
        )
        .increment(num_docs);
    }
}
