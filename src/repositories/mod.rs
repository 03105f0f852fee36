//! # Repository Layer
//!
//! SeaORM-backed implementation of the backfill store.

pub mod store;

pub use store::SeaOrmStore;
