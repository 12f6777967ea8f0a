use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema scripts in order; entry `n` moves the database to version `n + 1`.
const MIGRATIONS: &[&str] = &[
    include_str!("schemas/schema_v1.sql"),
    include_str!("schemas/schema_v2.sql"),
];

const CURRENT_SCHEMA_VERSION: usize = MIGRATIONS.len();

/// Brings the schema up to date. Migrations only ever add tables, nullable
/// columns or indexes; existing `id` and `synced` values are never rewritten.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let stored: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read schema version")?;
    let version = usize::try_from(stored).unwrap_or(usize::MAX);

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "activity log schema v{stored} is newer than this build supports (v{CURRENT_SCHEMA_VERSION})"
        );
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (index, script) in MIGRATIONS.iter().enumerate().skip(version) {
        tx.execute_batch(script)
            .with_context(|| format!("schema migration to v{} failed", index + 1))?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION as i64)?;
    tx.commit().context("failed to commit schema migrations")?;

    Ok(())
}
