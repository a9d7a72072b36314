//! Structural rewrite of the broker request before dispatch.
//!
//! The rewrite is idempotent and semantics-preserving: composite AND/OR
//! nodes with a single child collapse into that child, empty composites
//! disappear, nested composites of the same operator are flattened, and
//! nodes no longer reachable from the root are pruned from the arena.

use kestrel_common::request::{BrokerRequest, FilterQuery, FilterQueryMap};

#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerRequestOptimizer;

impl BrokerRequestOptimizer {
    pub fn new() -> Self {
        Self
    }

    pub fn optimize(&self, mut request: BrokerRequest) -> BrokerRequest {
        let root_id = match request.root_filter_id {
            Some(id) => id,
            None => return request,
        };

        let mut rewritten = FilterQueryMap::new();
        let new_root = simplify(&request.filter_sub_query_map, root_id, &mut rewritten);

        match new_root {
            Some(root) => {
                request.root_filter_id = Some(root);
                request.filter_sub_query_map = prune_unreachable(&rewritten, root);
            }
            None => {
                request.root_filter_id = None;
                request.filter_sub_query_map = FilterQueryMap::new();
            }
        }
        request
    }
}

/// Rewrite the subtree rooted at `id` into `out`, returning the id of the
/// node that effectively replaces it (`None` when the subtree vanishes).
fn simplify(map: &FilterQueryMap, id: i32, out: &mut FilterQueryMap) -> Option<i32> {
    let node = map.get(id)?;
    if !node.operator.is_composite() {
        out.put(node.clone());
        return Some(id);
    }

    let mut children = Vec::with_capacity(node.nested_filter_query_ids.len());
    for &child_id in &node.nested_filter_query_ids {
        let effective = match simplify(map, child_id, out) {
            Some(effective) => effective,
            None => continue,
        };
        // AND(AND(a, b), c) flattens to AND(a, b, c); same for OR.
        match out.get(effective) {
            Some(child) if child.operator == node.operator && child.operator.is_composite() => {
                children.extend(child.nested_filter_query_ids.iter().copied());
            }
            _ => children.push(effective),
        }
    }

    match children.len() {
        0 => None,
        1 => Some(children[0]),
        _ => {
            out.put(FilterQuery::composite(id, node.operator, children));
            Some(id)
        }
    }
}

fn prune_unreachable(map: &FilterQueryMap, root: i32) -> FilterQueryMap {
    let mut kept = FilterQueryMap::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if kept.get(id).is_some() {
            continue;
        }
        if let Some(node) = map.get(id) {
            stack.extend(node.nested_filter_query_ids.iter().copied());
            kept.put(node.clone());
        }
    }
    kept
}
