//! Core data models.
//!
//! `bucket`, `object` and `multipart` are the local store's metadata rows and
//! map to tables via `sqlx::FromRow`. `archive` holds the values that flow
//! through the archival pipeline, and `ledger` the durable progress records.

pub mod archive;
pub mod bucket;
pub mod ledger;
pub mod multipart;
pub mod object;
