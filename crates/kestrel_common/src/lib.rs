//! Shared data model for the Kestrel broker: the broker request tree, the
//! wire-level `DataTable` partial result, the merged `BrokerResponse`,
//! the error taxonomy, and broker configuration.

pub mod config;
pub mod datatable;
pub mod error;
pub mod metrics;
pub mod request;
pub mod response;
pub mod types;

pub use config::BrokerConfig;
pub use datatable::{ColumnType, DataSchema, DataTable, ObjectValue, Value};
pub use error::{ProcessingException, QueryError, QueryResult};
pub use metrics::{BrokerMetrics, QueryPhase};
pub use request::{
    AggregationInfo, AggregationType, BrokerRequest, FilterOperator, FilterQuery, FilterQueryMap,
    GroupBy, QuerySource, ResponseFormat, Selection, SelectionSort,
};
pub use response::{AggregationResult, BrokerResponse, GroupByEntry, SelectionResults};
pub use types::{SegmentIdSet, ServerInstance, TableType};
