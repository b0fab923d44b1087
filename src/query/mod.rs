pub mod cursor;
pub mod filter;
pub mod red;
pub mod request;
pub mod service_map;
pub mod summary;
pub mod tree;

pub use cursor::{paginate, Cursor, CursorError, Page};
pub use filter::{FieldValue, Filter, FilterError, FilterOperator, FilterSet, Filterable};
pub use red::{service_catalog, service_red_metrics, RedMetrics, ServiceSummary};
pub use request::{
    PageInfo, Pagination, QueryError, SearchQuery, SearchRequest, TimeRange, DEFAULT_LIMIT,
    MAX_LIMIT,
};
pub use service_map::{build_service_map, MapEdge, MapNode, NodeType, ServiceMap};
pub use summary::{TraceDetail, TraceSummary};
pub use tree::SpanTree;
