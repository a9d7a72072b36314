//! The merged broker response returned to the client.
//!
//! Serializes to the external JSON contract: `selectionResults` or
//! `aggregationResults`, an `exceptions` list of `{errorCode, message}`,
//! summed execution counters, `timeUsedMs`, and an optional `traceInfo`
//! map keyed by server hostname.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessingException, QueryError};

/// Reduced selection results: projected column names and rendered rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResults {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One `(group key, value)` entry of a group-by result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByEntry {
    pub group: Vec<String>,
    pub value: String,
}

/// One reduced aggregation: either a scalar value or a group-by listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by_columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by_result: Option<Vec<GroupByEntry>>,
}

impl AggregationResult {
    pub fn scalar(function: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            value: Some(value.into()),
            group_by_columns: None,
            group_by_result: None,
        }
    }

    pub fn grouped(
        function: impl Into<String>,
        group_by_columns: Vec<String>,
        group_by_result: Vec<GroupByEntry>,
    ) -> Self {
        Self {
            function: function.into(),
            value: None,
            group_by_columns: Some(group_by_columns),
            group_by_result: Some(group_by_result),
        }
    }
}

/// The merged result of one broker query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_results: Option<SelectionResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_results: Option<Vec<AggregationResult>>,
    #[serde(default)]
    pub exceptions: Vec<ProcessingException>,
    #[serde(default)]
    pub num_docs_scanned: u64,
    #[serde(default)]
    pub num_entries_scanned_in_filter: u64,
    #[serde(default)]
    pub num_entries_scanned_post_filter: u64,
    #[serde(default)]
    pub total_docs: u64,
    #[serde(default)]
    pub time_used_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_info: BTreeMap<String, String>,
}

impl BrokerResponse {
    /// An empty response of the correct shape, used when no shard produced data.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The response for a query whose logical table matched nothing. Not an
    /// error: same shape as an empty response.
    pub fn no_table_hit() -> Self {
        Self::default()
    }

    /// A well-formed response carrying a single whole-query failure.
    pub fn from_error(error: &QueryError) -> Self {
        Self {
            exceptions: vec![error.into()],
            ..Self::default()
        }
    }

    pub fn with_exceptions(exceptions: Vec<ProcessingException>) -> Self {
        Self {
            exceptions,
            ..Self::default()
        }
    }

    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;

    #[test]
    fn json_contract_field_names() {
        let mut response = BrokerResponse::empty();
        response.aggregation_results = Some(vec![AggregationResult::scalar("count_star", "100")]);
        response.num_docs_scanned = 100;
        response.time_used_ms = 12;
        response
            .trace_info
            .insert("host1".to_string(), "trace text".to_string());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["aggregationResults"][0]["function"], "count_star");
        assert_eq!(json["aggregationResults"][0]["value"], "100");
        assert_eq!(json["numDocsScanned"], 100);
        assert_eq!(json["timeUsedMs"], 12);
        assert_eq!(json["traceInfo"]["host1"], "trace text");
        assert!(json.get("selectionResults").is_none());
    }

    #[test]
    fn error_response_is_well_formed() {
        let response =
            BrokerResponse::from_error(&QueryError::QueryValidation("limit too large".into()));
        assert_eq!(response.exceptions.len(), 1);
        assert_eq!(response.exceptions[0].error_code, 230);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["exceptions"][0]["errorCode"], 230);
    }
}
