//! Group-by reduction: merge per-group partials across shards, then rank
//! and truncate each aggregation's groups.
//!
//! Group-by data tables carry one STRING column per group-by expression
//! followed by one column per aggregation; merging keys on the tuple of
//! group-by values and applies each function's combine law.

use std::collections::BTreeMap;

use kestrel_common::datatable::DataTable;
use kestrel_common::error::{QueryError, QueryResult};
use kestrel_common::request::{AggregationInfo, GroupBy};
use kestrel_common::response::{AggregationResult, GroupByEntry};
use kestrel_common::types::ServerInstance;

use super::Accumulator;

pub(crate) fn reduce_group_by(
    aggregations: &[AggregationInfo],
    group_by: &GroupBy,
    tables: &BTreeMap<ServerInstance, DataTable>,
) -> QueryResult<Vec<AggregationResult>> {
    let num_group_columns = group_by.expressions.len();
    let top_n = group_by.top_n.max(0) as usize;
    let mut results = Vec::with_capacity(aggregations.len());

    for (index, aggregation) in aggregations.iter().enumerate() {
        let column = num_group_columns + index;
        let mut groups: BTreeMap<Vec<String>, Accumulator> = BTreeMap::new();

        for table in tables.values() {
            for (row_index, row) in table.rows.iter().enumerate() {
                if row.len() <= column {
                    return Err(QueryError::Internal(format!(
                        "group-by row {} narrower than aggregation column {}",
                        row_index, column
                    )));
                }
                let key: Vec<String> = row[..num_group_columns]
                    .iter()
                    .map(|value| value.render())
                    .collect();
                groups
                    .entry(key)
                    .or_insert_with(|| Accumulator::new(aggregation.aggregation_type))
                    .merge(&row[column])?;
            }
        }

        // Rank descending by value; equal values order lexicographically by
        // group key. BTreeMap iteration already yields keys in that order,
        // so a stable sort on the value alone keeps the tie-break.
        let mut entries: Vec<(Vec<String>, Accumulator)> = groups.into_iter().collect();
        entries.sort_by(|a, b| {
            b.1.numeric_value()
                .total_cmp(&a.1.numeric_value())
                .then_with(|| a.0.cmp(&b.0))
        });
        entries.truncate(top_n);

        results.push(AggregationResult::grouped(
            aggregation.function_name(),
            group_by.expressions.clone(),
            entries
                .into_iter()
                .map(|(group, accumulator)| GroupByEntry {
                    group,
                    value: accumulator.format(),
                })
                .collect(),
        ));
    }
    Ok(results)
}
