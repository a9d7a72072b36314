//! Transport-side building blocks of the broker: per-server request
//! framing, replica selection policies, the scatter dispatcher, and the
//! composite future the gather phase waits on.

pub mod composite_future;
pub mod replica;
pub mod scatter_gather;
pub mod serde;
pub mod stats;

pub use composite_future::{CompositeFuture, GatherOutcome};
pub use replica::{
    HashReplicaSelection, RandomReplicaSelection, ReplicaSelection, ReplicaSelectionGranularity,
    ReplicaSelectionPolicy, RoundRobinReplicaSelection,
};
pub use scatter_gather::{ScatterGather, ScatterGatherRequest, ServerClient};
pub use serde::{InstanceRequest, SerDe};
pub use stats::ScatterGatherStats;
