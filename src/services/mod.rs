//! The metadata engine. [`Metabase`](metabase::Metabase) is the handle; each
//! module adds one group of operations to it.

pub mod aliases;
pub mod begin;
pub mod commit;
pub mod copy;
pub mod delete;
pub mod get;
pub mod iterate;
pub mod loop_iter;
pub mod metabase;
pub mod observer;

pub use metabase::Metabase;
