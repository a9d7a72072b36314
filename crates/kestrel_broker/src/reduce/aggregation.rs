//! Aggregation reduction: combine single-row per-server partials with each
//! function's associative merge law, then format for presentation.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use kestrel_common::datatable::{format_double, DataTable, ObjectValue, Value};
use kestrel_common::error::{QueryError, QueryResult};
use kestrel_common::request::{AggregationInfo, AggregationType};
use kestrel_common::response::AggregationResult;
use kestrel_common::types::ServerInstance;

/// Accumulates one aggregation's partials across shards.
///
/// Every merge is associative and commutative, so the accumulated value is
/// independent of shard arrival order.
#[derive(Debug, Clone)]
pub(crate) enum Accumulator {
    Count(i64),
    Sum(f64),
    Min(f64),
    Max(f64),
    Avg { sum: f64, count: i64 },
    Distinct(BTreeSet<String>),
    Percentile { quantile: u8, samples: Vec<f64> },
}

impl Accumulator {
    /// The identity accumulator for a function.
    pub(crate) fn new(aggregation_type: AggregationType) -> Self {
        match aggregation_type {
            AggregationType::Count => Accumulator::Count(0),
            AggregationType::Sum => Accumulator::Sum(0.0),
            AggregationType::Min => Accumulator::Min(f64::INFINITY),
            AggregationType::Max => Accumulator::Max(f64::NEG_INFINITY),
            AggregationType::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregationType::DistinctCount => Accumulator::Distinct(BTreeSet::new()),
            AggregationType::Percentile(quantile) => Accumulator::Percentile {
                quantile,
                samples: Vec::new(),
            },
        }
    }

    /// Fold one shard's partial into the accumulator.
    pub(crate) fn merge(&mut self, value: &Value) -> QueryResult<()> {
        match (self, value) {
            (Accumulator::Count(acc), Value::Long(v)) => *acc += v,
            (Accumulator::Sum(acc), v) => *acc += numeric(v)?,
            (Accumulator::Min(acc), v) => *acc = acc.min(numeric(v)?),
            (Accumulator::Max(acc), v) => *acc = acc.max(numeric(v)?),
            (
                Accumulator::Avg { sum, count },
                Value::Object(ObjectValue::AvgPair { sum: s, count: c }),
            ) => {
                *sum += s;
                *count += c;
            }
            (Accumulator::Distinct(acc), Value::Object(ObjectValue::DistinctSet(set))) => {
                acc.extend(set.iter().cloned());
            }
            (
                Accumulator::Percentile { samples, .. },
                Value::Object(ObjectValue::PercentileSamples(partial)),
            ) => samples.extend_from_slice(partial),
            (acc, value) => {
                return Err(QueryError::Internal(format!(
                    "aggregation partial {:?} does not match accumulator {:?}",
                    value, acc
                )))
            }
        }
        Ok(())
    }

    /// The reduced value as a number, for ordering group-by entries.
    pub(crate) fn numeric_value(&self) -> f64 {
        match self {
            Accumulator::Count(v) => *v as f64,
            Accumulator::Sum(v) => *v,
            Accumulator::Min(v) if v.is_infinite() => 0.0,
            Accumulator::Min(v) => *v,
            Accumulator::Max(v) if v.is_infinite() => 0.0,
            Accumulator::Max(v) => *v,
            Accumulator::Avg { sum, count } => {
                if *count == 0 {
                    0.0
                } else {
                    sum / *count as f64
                }
            }
            Accumulator::Distinct(set) => set.len() as f64,
            Accumulator::Percentile { quantile, samples } => nearest_rank(*quantile, samples),
        }
    }

    /// The reduced value in its presentation format: integral for counts,
    /// fixed-precision decimal for doubles.
    pub(crate) fn format(&self) -> String {
        match self {
            Accumulator::Count(v) => v.to_string(),
            Accumulator::Distinct(set) => set.len().to_string(),
            other => format_double(other.numeric_value()),
        }
    }
}

fn numeric(value: &Value) -> QueryResult<f64> {
    match value {
        Value::Long(v) => Ok(*v as f64),
        Value::Double(v) => Ok(*v),
        other => Err(QueryError::Internal(format!(
            "expected numeric aggregation partial, found {:?}",
            other
        ))),
    }
}

fn nearest_rank(quantile: u8, samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((quantile as f64 / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Reduce aggregation-only queries: column `i` of every single-row table
/// holds the partial for aggregation `i`.
pub(crate) fn reduce_aggregations(
    aggregations: &[AggregationInfo],
    tables: &BTreeMap<ServerInstance, DataTable>,
) -> QueryResult<Vec<AggregationResult>> {
    let mut results = Vec::with_capacity(aggregations.len());
    for (index, aggregation) in aggregations.iter().enumerate() {
        let mut accumulator = Accumulator::new(aggregation.aggregation_type);
        for table in tables.values() {
            if table.num_rows() == 0 {
                continue;
            }
            let value = table
                .rows
                .first()
                .and_then(|row| row.get(index))
                .ok_or_else(|| {
                    QueryError::Internal(format!(
                        "aggregation column {} missing from shard response",
                        index
                    ))
                })?;
            accumulator.merge(value)?;
        }
        results.push(AggregationResult::scalar(
            aggregation.function_name(),
            accumulator.format(),
        ));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::datatable::{ColumnType, DataSchema};

    fn single_row_table(values: Vec<Value>) -> DataTable {
        let types = values.iter().map(Value::column_type).collect();
        let names = (0..values.len()).map(|i| format!("agg{}", i)).collect();
        DataTable::new(DataSchema::new(names, types), vec![values])
    }

    fn tables(rows: Vec<Vec<Value>>) -> BTreeMap<ServerInstance, DataTable> {
        rows.into_iter()
            .enumerate()
            .map(|(i, values)| {
                (
                    ServerInstance::new(format!("s{}", i), 8098),
                    single_row_table(values),
                )
            })
            .collect()
    }

    #[test]
    fn count_sums_partial_counts() {
        let aggregations = vec![AggregationInfo::new(AggregationType::Count, "*")];
        let tables = tables(vec![vec![Value::Long(70)], vec![Value::Long(30)]]);
        let results = reduce_aggregations(&aggregations, &tables).unwrap();
        assert_eq!(results[0].function, "count_star");
        assert_eq!(results[0].value.as_deref(), Some("100"));
    }

    #[test]
    fn min_max_take_extremum() {
        let aggregations = vec![
            AggregationInfo::new(AggregationType::Min, "m"),
            AggregationInfo::new(AggregationType::Max, "m"),
        ];
        let tables = tables(vec![
            vec![Value::Double(3.5), Value::Double(3.5)],
            vec![Value::Double(-1.0), Value::Double(9.25)],
        ]);
        let results = reduce_aggregations(&aggregations, &tables).unwrap();
        assert_eq!(results[0].value.as_deref(), Some("-1"));
        assert_eq!(results[1].value.as_deref(), Some("9.25"));
    }

    #[test]
    fn avg_merges_sum_count_pairs() {
        let aggregations = vec![AggregationInfo::new(AggregationType::Avg, "m")];
        let tables = tables(vec![
            vec![Value::Object(ObjectValue::AvgPair { sum: 10.0, count: 4 })],
            vec![Value::Object(ObjectValue::AvgPair { sum: 2.0, count: 2 })],
        ]);
        let results = reduce_aggregations(&aggregations, &tables).unwrap();
        assert_eq!(results[0].value.as_deref(), Some("2"));
    }

    #[test]
    fn distinct_count_unions_sets() {
        let aggregations = vec![AggregationInfo::new(AggregationType::DistinctCount, "d")];
        let set_a: BTreeSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let set_b: BTreeSet<String> = ["y", "z"].iter().map(|s| s.to_string()).collect();
        let tables = tables(vec![
            vec![Value::Object(ObjectValue::DistinctSet(set_a))],
            vec![Value::Object(ObjectValue::DistinctSet(set_b))],
        ]);
        let results = reduce_aggregations(&aggregations, &tables).unwrap();
        assert_eq!(results[0].value.as_deref(), Some("3"));
    }

    #[test]
    fn percentile_merges_samples() {
        let aggregations = vec![AggregationInfo::new(AggregationType::Percentile(50), "m")];
        let tables = tables(vec![
            vec![Value::Object(ObjectValue::PercentileSamples(vec![1.0, 9.0]))],
            vec![Value::Object(ObjectValue::PercentileSamples(vec![5.0]))],
        ]);
        let results = reduce_aggregations(&aggregations, &tables).unwrap();
        assert_eq!(results[0].value.as_deref(), Some("5"));
    }

    #[test]
    fn merge_order_does_not_change_the_result() {
        let mut forward = Accumulator::new(AggregationType::Sum);
        forward.merge(&Value::Double(1.5)).unwrap();
        forward.merge(&Value::Double(2.5)).unwrap();
        let mut reversed = Accumulator::new(AggregationType::Sum);
        reversed.merge(&Value::Double(2.5)).unwrap();
        reversed.merge(&Value::Double(1.5)).unwrap();
        assert_eq!(forward.format(), reversed.format());
    }

    #[test]
    fn empty_shards_do_not_change_the_result() {
        let aggregations = vec![AggregationInfo::new(AggregationType::Sum, "m")];
        let mut with_empty = tables(vec![vec![Value::Double(4.0)]]);
        with_empty.insert(
            ServerInstance::new("empty", 8098),
            DataTable::new(
                DataSchema::new(vec!["agg0".into()], vec![ColumnType::Double]),
                Vec::new(),
            ),
        );
        let results = reduce_aggregations(&aggregations, &with_empty).unwrap();
        assert_eq!(results[0].value.as_deref(), Some("4"));
    }

    #[test]
    fn type_mismatch_is_an_internal_error() {
        let mut accumulator = Accumulator::new(AggregationType::Avg);
        let err = accumulator.merge(&Value::Long(3)).unwrap_err();
        assert_eq!(err.error_code(), 550);
    }
}
