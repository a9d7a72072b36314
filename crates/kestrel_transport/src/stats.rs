//! Per-query scatter/gather statistics for observability.

use std::collections::BTreeMap;
use std::fmt;

/// Wall-clock timings for one server's slot in a scatter.
#[derive(Debug, Clone, Default)]
pub struct PerServerStats {
    /// Segments this server was asked to search.
    pub num_segments: usize,
    /// Milliseconds from dispatch to request handed to the transport.
    pub send_time_ms: u64,
    /// Milliseconds from dispatch to response (or failure) observed.
    pub response_time_ms: u64,
}

/// Per-server timings collected over the lifetime of one query, across all
/// of its sub-requests.
#[derive(Debug, Clone, Default)]
pub struct ScatterGatherStats {
    entries: BTreeMap<String, PerServerStats>,
}

impl ScatterGatherStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server slot at dispatch time.
    pub fn initiate_request(&mut self, server_id: &str, num_segments: usize) {
        self.entries.entry(server_id.to_string()).or_default().num_segments = num_segments;
    }

    pub fn set_send_time_ms(&mut self, server_id: &str, millis: u64) {
        self.entries.entry(server_id.to_string()).or_default().send_time_ms = millis;
    }

    /// Record gather-side response times, keyed by server id.
    pub fn set_response_times_ms(&mut self, response_times: &BTreeMap<String, u64>) {
        for (server_id, millis) in response_times {
            self.entries.entry(server_id.clone()).or_default().response_time_ms = *millis;
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, PerServerStats> {
        &self.entries
    }
}

impl fmt::Display for ScatterGatherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (server_id, stats) in &self.entries {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            write!(
                f,
                "{}=(segments:{},sendMs:{},responseMs:{})",
                server_id, stats.num_segments, stats.send_time_ms, stats.response_time_ms
            )?;
        }
        Ok(())
    }
}
