//! tally-core - Core library for Tally
//!
//! This crate contains the local store, the credential vault and the cloud
//! sync engine shared by every Tally interface.

pub mod config;
pub mod credential;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod sync;
pub mod util;
pub mod vault;

pub use error::{Error, ErrorCode, ErrorResponse, RemoteError, Result};
pub use models::{ConflictPolicy, SyncResult, SyncStatus, SyncStrategy, SyncTable};
pub use sync::SyncService;
