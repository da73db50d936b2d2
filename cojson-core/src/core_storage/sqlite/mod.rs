//! SQLite backends (rusqlite + r2d2)

pub mod async_client;
pub mod client;
pub mod migrations;

pub use async_client::SqliteAsyncClient;
pub use client::SqliteClient;
