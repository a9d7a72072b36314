//! Replica selection: given the candidate replicas for a segment group,
//! pick the one server that will serve it.
//!
//! Policies are a closed set selected by configuration at dispatch time.
//! The round-robin policy keeps one cursor per replica group in a
//! concurrent map, so advancing a cursor never serializes unrelated
//! groups behind a process-wide lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::Rng;
use xxhash_rust::xxh3::xxh3_64;

use kestrel_common::types::ServerInstance;

/// Granularity of replica choice.
///
/// `SegmentIdSet` (the default) picks one replica for a whole segment
/// group; `Segment` would pick per individual segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicaSelectionGranularity {
    Segment,
    #[default]
    SegmentIdSet,
}

/// Configured policy names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicaSelectionPolicy {
    #[default]
    RoundRobin,
    Random,
    Hash,
}

/// A replica selection policy.
///
/// Implementations are shared across requests (the round-robin cursor
/// advances globally) and must be safe for concurrent use.
pub trait ReplicaSelection: Send + Sync {
    /// Pick one server out of `candidates` for the replica group identified
    /// by `group_key`. `hash_key` is the request's bucket-hash key, used by
    /// hash-based policies. Returns `None` only for an empty candidate list.
    fn select_server(
        &self,
        group_key: &str,
        candidates: &[ServerInstance],
        hash_key: Option<&str>,
    ) -> Option<ServerInstance>;
}

/// Round-robin across replicas, one cursor per replica group.
#[derive(Debug, Default)]
pub struct RoundRobinReplicaSelection {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinReplicaSelection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaSelection for RoundRobinReplicaSelection {
    fn select_server(
        &self,
        group_key: &str,
        candidates: &[ServerInstance],
        _hash_key: Option<&str>,
    ) -> Option<ServerInstance> {
        if candidates.is_empty() {
            return None;
        }
        let cursor = self
            .cursors
            .entry(group_key.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }
}

/// Uniform random replica choice.
#[derive(Debug, Default)]
pub struct RandomReplicaSelection;

impl ReplicaSelection for RandomReplicaSelection {
    fn select_server(
        &self,
        _group_key: &str,
        candidates: &[ServerInstance],
        _hash_key: Option<&str>,
    ) -> Option<ServerInstance> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[index].clone())
    }
}

/// Sticky choice by hashing the request's bucket-hash key, so equal keys
/// land on the same replica while the routing snapshot holds.
#[derive(Debug, Default)]
pub struct HashReplicaSelection;

impl ReplicaSelection for HashReplicaSelection {
    fn select_server(
        &self,
        group_key: &str,
        candidates: &[ServerInstance],
        hash_key: Option<&str>,
    ) -> Option<ServerInstance> {
        if candidates.is_empty() {
            return None;
        }
        let key = hash_key.unwrap_or(group_key);
        let index = (xxh3_64(key.as_bytes()) % candidates.len() as u64) as usize;
        Some(candidates[index].clone())
    }
}

/// Build the configured policy.
pub fn policy_for(policy: ReplicaSelectionPolicy) -> std::sync::Arc<dyn ReplicaSelection> {
    match policy {
        ReplicaSelectionPolicy::RoundRobin => {
            std::sync::Arc::new(RoundRobinReplicaSelection::new())
        }
        ReplicaSelectionPolicy::Random => std::sync::Arc::new(RandomReplicaSelection),
        ReplicaSelectionPolicy::Hash => std::sync::Arc::new(HashReplicaSelection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<ServerInstance> {
        vec![
            ServerInstance::new("s1", 8098),
            ServerInstance::new("s2", 8098),
            ServerInstance::new("s3", 8098),
        ]
    }

    #[test]
    fn round_robin_cycles_per_group() {
        let selection = RoundRobinReplicaSelection::new();
        let servers = candidates();
        let picks: Vec<_> = (0..4)
            .map(|_| selection.select_server("g1", &servers, None).unwrap())
            .collect();
        assert_eq!(picks[0], servers[0]);
        assert_eq!(picks[1], servers[1]);
        assert_eq!(picks[2], servers[2]);
        assert_eq!(picks[3], servers[0]);

        // An unrelated group starts from its own cursor.
        assert_eq!(
            selection.select_server("g2", &servers, None).unwrap(),
            servers[0]
        );
    }

    #[test]
    fn round_robin_cursor_is_shared_across_threads() {
        let selection = std::sync::Arc::new(RoundRobinReplicaSelection::new());
        let servers = candidates();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let selection = selection.clone();
            let servers = servers.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    selection.select_server("g", &servers, None).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // 300 selections later the cursor is back at the start.
        assert_eq!(
            selection.select_server("g", &servers, None).unwrap(),
            servers[0]
        );
    }

    #[test]
    fn hash_is_sticky_for_equal_keys() {
        let selection = HashReplicaSelection;
        let servers = candidates();
        let a = selection.select_server("g", &servers, Some("user-42")).unwrap();
        let b = selection.select_server("g", &servers, Some("user-42")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(RoundRobinReplicaSelection::new()
            .select_server("g", &[], None)
            .is_none());
        assert!(RandomReplicaSelection.select_server("g", &[], None).is_none());
        assert!(HashReplicaSelection.select_server("g", &[], None).is_none());
    }
}
