//! The broker request tree: what the query compiler produces and what gets
//! shipped to servers inside an `InstanceRequest`.
//!
//! The filter tree is stored flat as an `id -> node` arena with a root-id
//! field. Children are resolved by id lookup, which keeps the tree
//! wire-serializable without cyclic owning references. Parser-generated
//! nodes use non-negative ids; nodes synthesized by the broker (time
//! boundary filters, wrapper AND nodes) use negative ids so the two ranges
//! can never collide.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};

/// The table a query reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySource {
    pub table_name: String,
}

impl QuerySource {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }
}

/// Filter node operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    And,
    Or,
    Equality,
    Not,
    Range,
    Regexp,
    In,
    NotIn,
}

impl FilterOperator {
    /// Whether this operator combines child nodes rather than testing a column.
    pub fn is_composite(&self) -> bool {
        matches!(self, FilterOperator::And | FilterOperator::Or)
    }
}

/// One node of the filter tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQuery {
    pub id: i32,
    pub operator: FilterOperator,
    /// Column under test; unset for composite (AND/OR) nodes.
    pub column: Option<String>,
    /// Operand literals. Range literals use the `(*\t\t<v>)` / `[<v>\t\t*)` encoding.
    pub value: Vec<String>,
    /// Ids of nested child nodes, resolved through the `FilterQueryMap`.
    pub nested_filter_query_ids: Vec<i32>,
}

impl FilterQuery {
    /// A leaf predicate on a column.
    pub fn leaf(
        id: i32,
        operator: FilterOperator,
        column: impl Into<String>,
        value: Vec<String>,
    ) -> Self {
        Self {
            id,
            operator,
            column: Some(column.into()),
            value,
            nested_filter_query_ids: Vec::new(),
        }
    }

    /// A composite AND/OR node over child ids.
    pub fn composite(id: i32, operator: FilterOperator, children: Vec<i32>) -> Self {
        Self {
            id,
            operator,
            column: None,
            value: Vec::new(),
            nested_filter_query_ids: children,
        }
    }
}

/// Flat `id -> node` arena holding every filter node of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterQueryMap {
    nodes: HashMap<i32, FilterQuery>,
}

impl FilterQueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node under its own id. Returns an error on id collision,
    /// which would otherwise silently corrupt the tree.
    pub fn insert(&mut self, node: FilterQuery) -> QueryResult<()> {
        let id = node.id;
        if self.nodes.insert(id, node).is_some() {
            return Err(QueryError::Internal(format!(
                "duplicate filter node id {}",
                id
            )));
        }
        Ok(())
    }

    /// Insert or replace a node under its own id. Rewrite passes use this
    /// when rebuilding a tree whose ids are already known to be consistent.
    pub fn put(&mut self, node: FilterQuery) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: i32) -> Option<&FilterQuery> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.nodes.keys().copied()
    }

    pub fn remove(&mut self, id: i32) -> Option<FilterQuery> {
        self.nodes.remove(&id)
    }
}

/// Sort key for a selection query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSort {
    pub column: String,
    pub is_asc: bool,
}

/// Selection clause: projected columns, row limit, optional sort sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub selection_columns: Vec<String>,
    pub size: i64,
    #[serde(default)]
    pub selection_sort_sequence: Vec<SelectionSort>,
}

/// The closed set of aggregation functions the broker can reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationType {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    DistinctCount,
    /// Nearest-rank percentile at the given quantile (0..=100).
    Percentile(u8),
}

impl AggregationType {
    pub fn name(&self) -> String {
        match self {
            AggregationType::Count => "count".to_string(),
            AggregationType::Sum => "sum".to_string(),
            AggregationType::Min => "min".to_string(),
            AggregationType::Max => "max".to_string(),
            AggregationType::Avg => "avg".to_string(),
            AggregationType::DistinctCount => "distinctCount".to_string(),
            AggregationType::Percentile(q) => format!("percentile{}", q),
        }
    }

    /// Whether the reduced value renders as an integral number.
    pub fn is_integral(&self) -> bool {
        matches!(self, AggregationType::Count | AggregationType::DistinctCount)
    }
}

/// One aggregation of a query, e.g. `SUM(metric)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationInfo {
    pub aggregation_type: AggregationType,
    pub column: String,
}

impl AggregationInfo {
    pub fn new(aggregation_type: AggregationType, column: impl Into<String>) -> Self {
        Self {
            aggregation_type,
            column: column.into(),
        }
    }

    /// Presentation name, e.g. `sum_metric` or `count_star`.
    pub fn function_name(&self) -> String {
        format!(
            "{}_{}",
            self.aggregation_type.name(),
            self.column.replace('*', "star")
        )
    }
}

/// Group-by clause: grouping expressions and result truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBy {
    pub expressions: Vec<String>,
    pub top_n: i64,
}

/// Tag selecting the reducer family for the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseFormat {
    #[default]
    Native,
}

/// A compiled query as the broker processes it.
///
/// Deep copies (for hybrid splitting) are plain `Clone`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerRequest {
    pub query_source: QuerySource,
    pub selections: Option<Selection>,
    #[serde(default)]
    pub aggregations_info: Vec<AggregationInfo>,
    pub group_by: Option<GroupBy>,
    /// Root of the filter tree, if the query has one.
    pub root_filter_id: Option<i32>,
    #[serde(default)]
    pub filter_sub_query_map: FilterQueryMap,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub enable_trace: bool,
    #[serde(default)]
    pub debug_options: HashMap<String, String>,
    /// Opaque key feeding the hash replica-selection policy.
    pub bucket_hash_key: Option<String>,
}

impl BrokerRequest {
    /// A selection query skeleton, used by compilers and tests.
    pub fn selection(table_name: impl Into<String>, selection: Selection) -> Self {
        Self {
            query_source: QuerySource::new(table_name),
            selections: Some(selection),
            aggregations_info: Vec::new(),
            group_by: None,
            root_filter_id: None,
            filter_sub_query_map: FilterQueryMap::new(),
            response_format: ResponseFormat::Native,
            enable_trace: false,
            debug_options: HashMap::new(),
            bucket_hash_key: None,
        }
    }

    /// An aggregation query skeleton, with optional group-by.
    pub fn aggregation(
        table_name: impl Into<String>,
        aggregations: Vec<AggregationInfo>,
        group_by: Option<GroupBy>,
    ) -> Self {
        Self {
            query_source: QuerySource::new(table_name),
            selections: None,
            aggregations_info: aggregations,
            group_by,
            root_filter_id: None,
            filter_sub_query_map: FilterQueryMap::new(),
            response_format: ResponseFormat::Native,
            enable_trace: false,
            debug_options: HashMap::new(),
            bucket_hash_key: None,
        }
    }

    pub fn has_aggregations(&self) -> bool {
        !self.aggregations_info.is_empty()
    }

    pub fn has_group_by(&self) -> bool {
        self.group_by.is_some()
    }

    /// Structural invariants of the filter arena: the root exists, every
    /// referenced child id resolves, and the tree is acyclic.
    pub fn validate_filter(&self) -> QueryResult<()> {
        let root_id = match self.root_filter_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut visiting = HashSet::new();
        self.walk_filter(root_id, &mut visiting)
    }

    fn walk_filter(&self, id: i32, visiting: &mut HashSet<i32>) -> QueryResult<()> {
        if !visiting.insert(id) {
            return Err(QueryError::Internal(format!(
                "cycle in filter tree at node {}",
                id
            )));
        }
        let node = self.filter_sub_query_map.get(id).ok_or_else(|| {
            QueryError::Internal(format!("filter tree references missing node {}", id))
        })?;
        for &child in &node.nested_filter_query_ids {
            self.walk_filter(child, visiting)?;
        }
        visiting.remove(&id);
        Ok(())
    }
}
