//! Database module: entity models and SQL repositories.
//!
//! - `model`: insert payloads and view models returned by repositories.
//! - `repo`: pool setup, the store registry, users and the settings store.
//! - `orders`: the order mirror (orders and their line items).
//! - `jobs`: the job ledger for full-history syncs.
//!
//! External modules should import from `order_watchbot::db`; the repository
//! API is re-exported here.

pub mod jobs;
pub mod model;
pub mod orders;
pub mod repo;

pub use jobs::*;
pub use orders::*;
pub use repo::*;

pub use model::{NewStore, StoredLineItem, StoredOrder};
