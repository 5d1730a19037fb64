//! Object and segment metadata engine for an erasure-coded object store.
//!
//! Tracks object versions, their segments and the storage nodes holding
//! each piece, supports server-side copies that share pieces with their
//! ancestor, and promotes a copy when its ancestor is deleted.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use errors::{MetabaseError, MetabaseResult};
pub use services::Metabase;
