//! The gather primitive: many in-flight per-server requests as one
//! awaitable unit.
//!
//! A `CompositeFuture` completes when every replica group has reported or
//! the deadline elapses, whichever comes first. It tracks per-child
//! response times and supports best-effort cancellation of whatever is
//! still in flight. One task per contacted server, never per segment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use kestrel_common::error::{QueryError, QueryResult};
use kestrel_common::types::ServerInstance;

/// What one dispatched task reports back.
#[derive(Debug)]
pub(crate) struct ChildOutcome {
    /// Replica group this response satisfies. With speculative requests in
    /// play two servers can answer for one group; the first wins.
    pub group_key: String,
    pub server: ServerInstance,
    pub result: QueryResult<Bytes>,
    pub elapsed_ms: u64,
}

/// The gathered result of one scatter.
#[derive(Debug, Default)]
pub struct GatherOutcome {
    pub responses: HashMap<ServerInstance, Bytes>,
    pub errors: Vec<(ServerInstance, QueryError)>,
}

/// Handle over all in-flight per-server requests of one scatter call.
pub struct CompositeFuture {
    rx: mpsc::Receiver<ChildOutcome>,
    /// `(group key, primary server)` per expected response slot.
    expected_groups: Vec<(String, ServerInstance)>,
    abort_handles: Vec<AbortHandle>,
    response_times_ms: BTreeMap<String, u64>,
}

impl CompositeFuture {
    pub(crate) fn new(
        rx: mpsc::Receiver<ChildOutcome>,
        expected_groups: Vec<(String, ServerInstance)>,
        abort_handles: Vec<AbortHandle>,
    ) -> Self {
        Self {
            rx,
            expected_groups,
            abort_handles,
            response_times_ms: BTreeMap::new(),
        }
    }

    /// Wait until every group has reported or `timeout` elapses.
    ///
    /// Successes land in `responses`; failures and never-reported groups
    /// become `BrokerGather` errors. Whatever is still in flight afterwards
    /// is cancelled best-effort.
    pub async fn await_responses(&mut self, timeout: Duration) -> GatherOutcome {
        let deadline = Instant::now() + timeout;
        let mut outcome = GatherOutcome::default();
        let mut satisfied: HashSet<String> = HashSet::new();

        while satisfied.len() < self.expected_groups.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(child)) => {
                    self.response_times_ms
                        .insert(child.server.to_string(), child.elapsed_ms);
                    if !satisfied.insert(child.group_key.clone()) {
                        // A speculative duplicate lost the race.
                        continue;
                    }
                    match child.result {
                        Ok(bytes) => {
                            outcome.responses.insert(child.server, bytes);
                        }
                        Err(e) => outcome.errors.push((child.server, e)),
                    }
                }
                // All senders dropped: nothing further can arrive.
                Ok(None) => break,
                // Deadline elapsed.
                Err(_) => break,
            }
        }
        self.cancel();

        for (group_key, server) in &self.expected_groups {
            if !satisfied.contains(group_key) {
                outcome.errors.push((
                    server.clone(),
                    QueryError::BrokerGather(format!(
                        "server {} did not respond within {}ms",
                        server,
                        timeout.as_millis()
                    )),
                ));
            }
        }
        outcome
    }

    /// Per-server wall-clock response times observed so far, keyed by
    /// server id.
    pub fn response_times_ms(&self) -> &BTreeMap<String, u64> {
        &self.response_times_ms
    }

    /// Abort every outstanding per-server task, best-effort.
    pub fn cancel(&self) {
        for handle in &self.abort_handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> ServerInstance {
        ServerInstance::new(name, 8098)
    }

    fn spawn_child(
        tx: mpsc::Sender<ChildOutcome>,
        server: ServerInstance,
        delay: Duration,
        result: QueryResult<Bytes>,
    ) -> AbortHandle {
        let group_key = server.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(ChildOutcome {
                    group_key,
                    server,
                    result,
                    elapsed_ms: delay.as_millis() as u64,
                })
                .await;
        });
        handle.abort_handle()
    }

    #[tokio::test]
    async fn completes_on_all() {
        let (tx, rx) = mpsc::channel(4);
        let s1 = server("s1");
        let s2 = server("s2");
        let aborts = vec![
            spawn_child(tx.clone(), s1.clone(), Duration::from_millis(1), Ok(Bytes::from("a"))),
            spawn_child(tx.clone(), s2.clone(), Duration::from_millis(2), Ok(Bytes::from("b"))),
        ];
        drop(tx);
        let mut future = CompositeFuture::new(
            rx,
            vec![(s1.to_string(), s1.clone()), (s2.to_string(), s2.clone())],
            aborts,
        );
        let outcome = future.await_responses(Duration::from_secs(1)).await;
        assert_eq!(outcome.responses.len(), 2);
        assert!(outcome.errors.is_empty());
        assert!(future.response_times_ms().contains_key("s1_8098"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_missing_slots_into_gather_errors() {
        let (tx, rx) = mpsc::channel(4);
        let fast = server("fast");
        let slow = server("slow");
        let aborts = vec![
            spawn_child(tx.clone(), fast.clone(), Duration::from_millis(1), Ok(Bytes::from("a"))),
            spawn_child(tx.clone(), slow.clone(), Duration::from_secs(60), Ok(Bytes::from("b"))),
        ];
        drop(tx);
        let mut future = CompositeFuture::new(
            rx,
            vec![(fast.to_string(), fast.clone()), (slow.to_string(), slow.clone())],
            aborts,
        );
        let outcome = future.await_responses(Duration::from_millis(50)).await;
        assert_eq!(outcome.responses.len(), 1);
        assert!(outcome.responses.contains_key(&fast));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].0, slow);
        assert_eq!(outcome.errors[0].1.error_code(), 427);
    }

    #[tokio::test]
    async fn first_response_wins_within_a_group() {
        let (tx, rx) = mpsc::channel(4);
        let primary = server("primary");
        let backup = server("backup");
        let group = primary.to_string();
        for (who, payload, delay) in [
            (primary.clone(), "p", Duration::from_millis(1)),
            (backup.clone(), "b", Duration::from_millis(2)),
        ] {
            let tx = tx.clone();
            let group = group.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx
                    .send(ChildOutcome {
                        group_key: group,
                        server: who,
                        result: Ok(Bytes::from(payload)),
                        elapsed_ms: delay.as_millis() as u64,
                    })
                    .await;
            });
        }
        drop(tx);
        let mut future =
            CompositeFuture::new(rx, vec![(group.clone(), primary.clone())], Vec::new());
        let outcome = future.await_responses(Duration::from_secs(1)).await;
        assert_eq!(outcome.responses.len(), 1);
        assert_eq!(outcome.responses[&primary], Bytes::from("p"));
        assert!(outcome.errors.is_empty());
    }
}
