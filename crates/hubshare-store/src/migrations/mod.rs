//! Schema migrations, applied in order and tracked through the
//! `user_version` pragma.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, step)`; a database at `user_version = n` has every step
/// up to and including `n` applied.
const MIGRATIONS: &[(u32, &str, Step)] = &[(1, "initial hub schema", v001_initial::up)];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    for &(version, name, step) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, name, "applying migration");
        step(conn).map_err(|e| StoreError::Migration { version, reason: e.to_string() })?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
