//! # hubshare-store
//!
//! Durable hub state backed by SQLite: registered users, file records,
//! the revocation log and the audit log.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`. Mutations that touch a file record and the audit
//! log together run inside a single transaction.

pub mod audit;
pub mod database;
pub mod files;
pub mod migrations;
pub mod models;
pub mod revocations;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
