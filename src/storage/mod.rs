//! Row-store backends.
//!
//! - [`traits`]: the [`RowStore`](traits::RowStore) contract and typed filters
//! - [`memory`]: DashMap-backed store with registrable procedures
//! - [`sql`]: SQLite / MySQL store through sqlx

pub mod memory;
pub mod sql;
pub mod traits;
