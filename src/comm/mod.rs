//! Communication layer: connection pool, request cache and the optimizer
//! that ties them together with the compressor.

pub mod cache;
pub mod optimizer;
pub mod pool;

pub use cache::{CacheStats, EvictionStrategy, RequestCache};
pub use optimizer::{BatchResponse, CommunicationOptimizer, CommunicationStats, OptimizationProposal, RequestOptions};
pub use pool::{ConnectionLease, ConnectionPool, PoolStats};
