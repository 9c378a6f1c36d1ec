//! Database layer for Tally

mod connection;
mod local_store;
mod migrations;
mod settings_repository;

pub use connection::Database;
pub use local_store::{LibSqlStore, LocalStore, TableSnapshot};
pub use settings_repository::{SettingsRepository, DEFAULT_SETTING_ID};
