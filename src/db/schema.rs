//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

// Record ids are assigned by the devices so they stay stable everywhere.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS expenses (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    amount REAL NOT NULL,
    category TEXT,
    date TEXT,
    person_id INTEGER,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(date);

CREATE TABLE IF NOT EXISTS incomes (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    amount REAL NOT NULL,
    source TEXT,
    date TEXT,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_incomes_date ON incomes(date);

CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT,
    email TEXT,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS debts (
    id INTEGER PRIMARY KEY,
    person_id INTEGER,
    description TEXT NOT NULL,
    amount REAL NOT NULL,
    -- 'owed' (we owe) or 'lent' (owed to us)
    kind TEXT,
    due_date TEXT,
    paid INTEGER NOT NULL DEFAULT 0,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_debts_person_id ON debts(person_id);

CREATE TABLE IF NOT EXISTS passwords (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    username TEXT,
    password TEXT NOT NULL,
    url TEXT,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Persistently paired devices, keyed by SHA-256 of the device identifier
CREATE TABLE IF NOT EXISTS paired_devices (
    device_hash TEXT PRIMARY KEY,
    authorized_at TEXT NOT NULL,
    last_sync TEXT
);
"#;
