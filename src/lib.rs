//! # Webhook Backfill Library
//!
//! Recovers webhook events missed while a workflow's trigger was down: job
//! lifecycle, recovery strategies, downtime detection, analytics and the
//! HTTP API around them.

pub mod analytics;
pub mod auth;
pub mod backfill;
pub mod config;
pub mod connectors;
pub mod db;
pub mod downtime;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub use migration;
