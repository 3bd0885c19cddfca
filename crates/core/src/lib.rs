//! Client-side core of Canteiro: tenant-scoped session state, temporary-id
//! reconciliation, allocation parsing, resource histograms and the
//! debounced sync engine that keeps it all in step with the backend.

pub mod allocation;
pub mod cache;
pub mod calendar;
pub mod config;
pub mod edits;
pub mod engine;
pub mod error;
pub mod guard;
pub mod histogram;
pub mod http;
pub mod memory;
pub mod models;
pub mod notify;
pub mod realtime;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod tenancy;

pub use engine::SyncEngine;
pub use error::{CoreError, Result};
pub use http::Client;
