//! Reduction: merge per-server partial result tables into one broker
//! response.
//!
//! Three reducer paths selected by request shape (selection, aggregation,
//! group-by), plus metadata reduction shared by all of them: execution
//! counters are summed, per-shard exception entries are collected, and
//! trace text is keyed by server hostname.

mod aggregation;
mod group_by;
mod selection;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kestrel_common::datatable::{DataTable, EXCEPTION_KEY_PREFIX, NUM_DOCS_SCANNED_KEY,
    NUM_ENTRIES_SCANNED_IN_FILTER_KEY, NUM_ENTRIES_SCANNED_POST_FILTER_KEY, TOTAL_DOCS_KEY,
    TRACE_INFO_KEY};
use kestrel_common::error::ProcessingException;
use kestrel_common::request::{BrokerRequest, ResponseFormat};
use kestrel_common::response::BrokerResponse;
use kestrel_common::types::ServerInstance;

pub(crate) use aggregation::Accumulator;

/// Merges partial result tables into a broker response.
pub trait ReduceService: Send + Sync {
    fn reduce_on_data_table(
        &self,
        request: &BrokerRequest,
        data_tables: BTreeMap<ServerInstance, DataTable>,
    ) -> BrokerResponse;
}

/// Closed registry of reducers keyed by response format.
pub struct ReduceServiceRegistry {
    services: HashMap<ResponseFormat, Arc<dyn ReduceService>>,
}

impl ReduceServiceRegistry {
    pub fn new() -> Self {
        let mut services: HashMap<ResponseFormat, Arc<dyn ReduceService>> = HashMap::new();
        services.insert(ResponseFormat::Native, Arc::new(BrokerReduceService));
        Self { services }
    }

    pub fn get(&self, format: ResponseFormat) -> Arc<dyn ReduceService> {
        // The registry always carries the native reducer.
        self.services
            .get(&format)
            .cloned()
            .unwrap_or_else(|| Arc::new(BrokerReduceService))
    }
}

impl Default for ReduceServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The native reducer.
pub struct BrokerReduceService;

impl ReduceService for BrokerReduceService {
    fn reduce_on_data_table(
        &self,
        request: &BrokerRequest,
        data_tables: BTreeMap<ServerInstance, DataTable>,
    ) -> BrokerResponse {
        if data_tables.is_empty() {
            return BrokerResponse::empty();
        }

        let mut response = BrokerResponse::empty();

        // Metadata reduction over every table, including ones about to be
        // dropped for having no rows.
        let mut entry_with_schema: Option<(ServerInstance, DataTable)> = None;
        let mut kept: BTreeMap<ServerInstance, DataTable> = BTreeMap::new();
        for (server, table) in data_tables {
            if request.enable_trace {
                if let Some(trace) = table.metadata.get(TRACE_INFO_KEY) {
                    response
                        .trace_info
                        .insert(server.hostname.clone(), trace.clone());
                }
            }
            for (key, message) in table.metadata.iter() {
                if let Some(code) = key.strip_prefix(EXCEPTION_KEY_PREFIX) {
                    if let Ok(code) = code.parse::<i32>() {
                        response
                            .exceptions
                            .push(ProcessingException::new(code, message.clone()));
                    }
                }
            }
            response.num_docs_scanned += table.metadata_counter(NUM_DOCS_SCANNED_KEY);
            response.num_entries_scanned_in_filter +=
                table.metadata_counter(NUM_ENTRIES_SCANNED_IN_FILTER_KEY);
            response.num_entries_scanned_post_filter +=
                table.metadata_counter(NUM_ENTRIES_SCANNED_POST_FILTER_KEY);
            response.total_docs += table.metadata_counter(TOTAL_DOCS_KEY);

            if table.num_rows() == 0 {
                // Remember one schema-carrying empty table so an all-empty
                // result still reduces to a correctly shaped response.
                if entry_with_schema.is_none() && table.schema.is_some() {
                    entry_with_schema = Some((server, table));
                }
            } else {
                kept.insert(server, table);
            }
        }
        if kept.is_empty() {
            if let Some((server, table)) = entry_with_schema {
                kept.insert(server, table);
            }
        }
        let mut tables = kept;

        if !tables.is_empty() {
            if let Some(selection) = &request.selections {
                match selection::attach_selection_results(selection, &mut tables) {
                    Ok((results, dropped)) => {
                        if let Some(exception) = dropped {
                            response.exceptions.push(exception);
                        }
                        response.selection_results = Some(results);
                    }
                    Err(e) => response.exceptions.push((&e).into()),
                }
            } else if let Some(group_by) = &request.group_by {
                match group_by::reduce_group_by(&request.aggregations_info, group_by, &tables) {
                    Ok(results) => response.aggregation_results = Some(results),
                    Err(e) => response.exceptions.push((&e).into()),
                }
            } else if request.has_aggregations() {
                match aggregation::reduce_aggregations(&request.aggregations_info, &tables) {
                    Ok(results) => response.aggregation_results = Some(results),
                    Err(e) => response.exceptions.push((&e).into()),
                }
            }
        }

        response
    }
}
