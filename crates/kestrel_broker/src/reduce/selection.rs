//! Selection reduction: merge per-server row blocks into the final
//! projected, (optionally) ordered, size-limited result.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::collections::BTreeMap;

use kestrel_common::datatable::{DataSchema, DataTable, Value};
use kestrel_common::error::{
    ProcessingException, QueryError, QueryResult, MERGE_RESPONSE_ERROR_CODE,
};
use kestrel_common::request::{Selection, SelectionSort};
use kestrel_common::response::SelectionResults;
use kestrel_common::types::ServerInstance;

/// Reduce selection tables against a reference schema.
///
/// Tables whose schema differs from the reference (the first table in
/// server order) are dropped and reported through a single
/// `MergeResponseError` naming the dropped servers.
pub(crate) fn attach_selection_results(
    selection: &Selection,
    tables: &mut BTreeMap<ServerInstance, DataTable>,
) -> QueryResult<(SelectionResults, Option<ProcessingException>)> {
    let reference_schema = tables
        .values()
        .next()
        .and_then(|t| t.schema.clone())
        .ok_or_else(|| QueryError::Internal("selection reduce with no data schema".to_string()))?;

    let dropped = remove_conflicting_responses(&reference_schema, tables);
    let exception = if dropped.is_empty() {
        None
    } else {
        let message = format!(
            "responses from servers {:?} got dropped due to data schema mismatch",
            dropped
        );
        tracing::error!("{}", message);
        Some(ProcessingException::new(MERGE_RESPONSE_ERROR_CODE, message))
    };

    let size = selection.size.max(0) as usize;
    let rows = if selection.selection_sort_sequence.is_empty() {
        reduce_without_ordering(tables, size)
    } else {
        reduce_with_ordering(
            tables,
            &reference_schema,
            &selection.selection_sort_sequence,
            size,
        )?
    };

    let results = render(rows, &reference_schema, &selection.selection_columns)?;
    Ok((results, exception))
}

fn remove_conflicting_responses(
    reference: &DataSchema,
    tables: &mut BTreeMap<ServerInstance, DataTable>,
) -> Vec<String> {
    let conflicting: Vec<ServerInstance> = tables
        .iter()
        .filter(|(_, table)| table.schema.as_ref() != Some(reference))
        .map(|(server, _)| server.clone())
        .collect();
    conflicting
        .into_iter()
        .map(|server| {
            tables.remove(&server);
            server.to_string()
        })
        .collect()
}

/// Unordered concatenation in server order, stopping at `size` rows.
fn reduce_without_ordering(
    tables: &BTreeMap<ServerInstance, DataTable>,
    size: usize,
) -> Vec<Vec<Value>> {
    let mut rows = Vec::with_capacity(size.min(1024));
    for table in tables.values() {
        for row in &table.rows {
            if rows.len() >= size {
                return rows;
            }
            rows.push(row.clone());
        }
    }
    rows
}

/// One cursor into one table's row block during the ordered merge.
struct MergeEntry<'a> {
    row: &'a [Value],
    table_index: usize,
    row_index: usize,
    sort_columns: &'a [(usize, bool)],
}

impl MergeEntry<'_> {
    fn key_ordering(&self, other: &Self) -> Ordering {
        compare_rows(self.row, other.row, self.sort_columns)
            // Tie-breakers make the ordering total: server order first,
            // then intra-table row index.
            .then_with(|| self.table_index.cmp(&other.table_index))
            .then_with(|| self.row_index.cmp(&other.row_index))
    }
}

impl PartialEq for MergeEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key_ordering(other) == Ordering::Equal
    }
}
impl Eq for MergeEntry<'_> {}
impl PartialOrd for MergeEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MergeEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_ordering(other)
    }
}

/// Ordered merge across tables keyed by the sort sequence.
///
/// Each table is iterated in its own order. When every table arrives
/// pre-sorted (the normal case, servers sort before responding) this is a
/// k-way heap merge with early stop at `size`; otherwise the rows are
/// concatenated and sorted with the same total order.
fn reduce_with_ordering(
    tables: &BTreeMap<ServerInstance, DataTable>,
    schema: &DataSchema,
    sort_sequence: &[SelectionSort],
    size: usize,
) -> QueryResult<Vec<Vec<Value>>> {
    let sort_columns = resolve_sort_columns(schema, sort_sequence)?;

    let table_rows: Vec<&[Vec<Value>]> = tables.values().map(|t| t.rows.as_slice()).collect();
    let pre_sorted = table_rows.iter().all(|rows| {
        rows.windows(2)
            .all(|w| compare_rows(&w[0], &w[1], &sort_columns) != Ordering::Greater)
    });

    if pre_sorted {
        let mut heap: BinaryHeap<Reverse<MergeEntry<'_>>> = BinaryHeap::new();
        for (table_index, rows) in table_rows.iter().enumerate() {
            if let Some(row) = rows.first() {
                heap.push(Reverse(MergeEntry {
                    row,
                    table_index,
                    row_index: 0,
                    sort_columns: &sort_columns,
                }));
            }
        }
        let mut merged = Vec::with_capacity(size.min(1024));
        while let Some(Reverse(entry)) = heap.pop() {
            merged.push(entry.row.to_vec());
            if merged.len() >= size {
                break;
            }
            let next_index = entry.row_index + 1;
            if let Some(row) = table_rows[entry.table_index].get(next_index) {
                heap.push(Reverse(MergeEntry {
                    row,
                    table_index: entry.table_index,
                    row_index: next_index,
                    sort_columns: &sort_columns,
                }));
            }
        }
        Ok(merged)
    } else {
        let mut indexed: Vec<(usize, usize, &Vec<Value>)> = Vec::new();
        for (table_index, rows) in table_rows.iter().enumerate() {
            for (row_index, row) in rows.iter().enumerate() {
                indexed.push((table_index, row_index, row));
            }
        }
        indexed.sort_by(|a, b| {
            compare_rows(a.2, b.2, &sort_columns)
                .then_with(|| a.0.cmp(&b.0))
                .then_with(|| a.1.cmp(&b.1))
        });
        Ok(indexed
            .into_iter()
            .take(size)
            .map(|(_, _, row)| row.clone())
            .collect())
    }
}

fn resolve_sort_columns(
    schema: &DataSchema,
    sort_sequence: &[SelectionSort],
) -> QueryResult<Vec<(usize, bool)>> {
    sort_sequence
        .iter()
        .map(|sort| {
            schema
                .column_index(&sort.column)
                .map(|index| (index, sort.is_asc))
                .ok_or_else(|| {
                    QueryError::Internal(format!(
                        "sort column {} missing from data schema",
                        sort.column
                    ))
                })
        })
        .collect()
}

fn compare_rows(a: &[Value], b: &[Value], sort_columns: &[(usize, bool)]) -> Ordering {
    for &(index, is_asc) in sort_columns {
        let ordering = compare_values(a.get(index), b.get(index));
        let ordering = if is_asc { ordering } else { ordering.reverse() };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => match (va, vb) {
            (Value::Long(x), Value::Long(y)) => x.cmp(y),
            (Value::Double(x), Value::Double(y)) => x.total_cmp(y),
            (Value::Long(x), Value::Double(y)) => (*x as f64).total_cmp(y),
            (Value::Double(x), Value::Long(y)) => x.total_cmp(&(*y as f64)),
            (Value::Text(x), Value::Text(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

/// Project rows onto the selection columns in their declared order and
/// render every cell.
fn render(
    rows: Vec<Vec<Value>>,
    schema: &DataSchema,
    selection_columns: &[String],
) -> QueryResult<SelectionResults> {
    let projection: Vec<usize> = selection_columns
        .iter()
        .map(|column| {
            schema.column_index(column).ok_or_else(|| {
                QueryError::Internal(format!(
                    "selection column {} missing from data schema",
                    column
                ))
            })
        })
        .collect::<QueryResult<_>>()?;

    let rendered = rows
        .into_iter()
        .map(|row| {
            projection
                .iter()
                .map(|&index| row.get(index).map(Value::render).unwrap_or_default())
                .collect()
        })
        .collect();
    Ok(SelectionResults {
        columns: selection_columns.to_vec(),
        rows: rendered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::datatable::ColumnType;

    fn schema() -> DataSchema {
        DataSchema::new(
            vec!["a".into(), "m".into()],
            vec![ColumnType::String, ColumnType::Long],
        )
    }

    fn table(rows: Vec<(&str, i64)>) -> DataTable {
        DataTable::new(
            schema(),
            rows.into_iter()
                .map(|(a, m)| vec![Value::Text(a.into()), Value::Long(m)])
                .collect(),
        )
    }

    fn selection(size: i64, sort: Vec<SelectionSort>) -> Selection {
        Selection {
            selection_columns: vec!["a".into(), "m".into()],
            size,
            selection_sort_sequence: sort,
        }
    }

    #[test]
    fn unordered_concatenation_respects_size() {
        let mut tables = BTreeMap::new();
        tables.insert(ServerInstance::new("s1", 1), table(vec![("x", 1), ("y", 2)]));
        tables.insert(ServerInstance::new("s2", 1), table(vec![("z", 3)]));

        let (results, dropped) =
            attach_selection_results(&selection(2, Vec::new()), &mut tables).unwrap();
        assert!(dropped.is_none());
        assert_eq!(results.rows.len(), 2);
        assert_eq!(results.rows[0], vec!["x", "1"]);
    }

    #[test]
    fn ordered_merge_yields_global_order() {
        let mut tables = BTreeMap::new();
        tables.insert(ServerInstance::new("s1", 1), table(vec![("a", 9), ("b", 3)]));
        tables.insert(ServerInstance::new("s2", 1), table(vec![("c", 7), ("d", 1)]));

        let sort = vec![SelectionSort {
            column: "m".into(),
            is_asc: false,
        }];
        let (results, _) = attach_selection_results(&selection(3, sort), &mut tables).unwrap();
        let metrics: Vec<&str> = results.rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(metrics, vec!["9", "7", "3"]);
    }

    #[test]
    fn ordered_merge_is_stable_under_table_order() {
        // Equal sort keys resolve by server order, then row index, so the
        // merged output does not depend on arrival order.
        let sort = vec![SelectionSort {
            column: "m".into(),
            is_asc: true,
        }];
        let mut forward = BTreeMap::new();
        forward.insert(ServerInstance::new("s1", 1), table(vec![("x", 5)]));
        forward.insert(ServerInstance::new("s2", 1), table(vec![("y", 5)]));
        let (first, _) =
            attach_selection_results(&selection(2, sort.clone()), &mut forward).unwrap();

        let mut reversed = BTreeMap::new();
        reversed.insert(ServerInstance::new("s2", 1), table(vec![("y", 5)]));
        reversed.insert(ServerInstance::new("s1", 1), table(vec![("x", 5)]));
        let (second, _) = attach_selection_results(&selection(2, sort), &mut reversed).unwrap();

        assert_eq!(first.rows, second.rows);
        assert_eq!(first.rows[0][0], "x");
    }

    #[test]
    fn conflicting_schema_is_dropped_and_reported() {
        let mut tables = BTreeMap::new();
        tables.insert(ServerInstance::new("s1", 1), table(vec![("x", 1)]));
        let other_schema = DataSchema::new(vec!["different".into()], vec![ColumnType::Long]);
        tables.insert(
            ServerInstance::new("s2", 1),
            DataTable::new(other_schema, vec![vec![Value::Long(5)]]),
        );

        let (results, dropped) =
            attach_selection_results(&selection(10, Vec::new()), &mut tables).unwrap();
        let exception = dropped.unwrap();
        assert_eq!(exception.error_code, MERGE_RESPONSE_ERROR_CODE);
        assert!(exception.message.contains("s2_1"));
        assert_eq!(results.rows, vec![vec!["x".to_string(), "1".to_string()]]);
    }

    #[test]
    fn unsorted_shard_output_still_merges_totally_ordered() {
        let mut tables = BTreeMap::new();
        // Rows deliberately not in ascending order.
        tables.insert(ServerInstance::new("s1", 1), table(vec![("a", 4), ("b", 2)]));
        let sort = vec![SelectionSort {
            column: "m".into(),
            is_asc: true,
        }];
        let (results, _) = attach_selection_results(&selection(2, sort), &mut tables).unwrap();
        let metrics: Vec<&str> = results.rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(metrics, vec!["2", "4"]);
    }
}
