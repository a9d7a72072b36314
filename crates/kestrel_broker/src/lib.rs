//! The broker query pipeline: accept a query, validate and optimize it,
//! resolve the physical tables and their servers, scatter per-server
//! sub-requests, gather and deserialize partial results, and reduce them
//! into one response.

pub mod handler;
pub mod optimizer;
pub mod reduce;
pub mod routing;


pub use handler::{BrokerRequestHandler, RequestCompiler};
pub use optimizer::BrokerRequestOptimizer;
pub use reduce::{BrokerReduceService, ReduceService, ReduceServiceRegistry};
pub use routing::{
    InMemoryRoutingTable, InMemoryTimeBoundaryService, RoutingLookupRequest, RoutingTable,
    TimeBoundaryInfo, TimeBoundaryService,
};
