//! Synced record types and their storage
//!
//! Each entity kind is a concrete row type implementing [`SyncEntity`], which
//! carries the table, column list and binder used by [`RecordRepository`].

use serde::{Deserialize, Deserializer, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Sqlite, SqlitePool};

use crate::error::Result;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Kinds of records exchanged with paired devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Expenses,
    Incomes,
    People,
    Debts,
    Passwords,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Expenses,
        EntityKind::Incomes,
        EntityKind::People,
        EntityKind::Debts,
        EntityKind::Passwords,
    ];

    /// Backing table name
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Expenses => "expenses",
            EntityKind::Incomes => "incomes",
            EntityKind::People => "people",
            EntityKind::Debts => "debts",
            EntityKind::Passwords => "passwords",
        }
    }

    /// Passwords are served to devices but never accepted from them.
    pub fn accepts_remote_writes(self) -> bool {
        !matches!(self, EntityKind::Passwords)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// A record type that can be read in bulk and upserted by id.
pub trait SyncEntity:
    Serialize + for<'de> Deserialize<'de> + for<'r> FromRow<'r, SqliteRow> + Send + Sync + Unpin + 'static
{
    const KIND: EntityKind;

    /// Column names, in the order [`SyncEntity::bind_columns`] binds them
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> i64;

    /// Logical version marker used by last-writer-wins
    fn created_at(&self) -> &str;

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

/// Expense record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Expense {
    pub id: i64,
    pub description: String,
    pub amount: f64,
    pub category: Option<String>,
    pub date: Option<String>,
    pub person_id: Option<i64>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl SyncEntity for Expense {
    const KIND: EntityKind = EntityKind::Expenses;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "description",
        "amount",
        "category",
        "date",
        "person_id",
        "notes",
        "created_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(&self.description)
            .bind(self.amount)
            .bind(&self.category)
            .bind(&self.date)
            .bind(self.person_id)
            .bind(&self.notes)
            .bind(&self.created_at)
    }
}

/// Income record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Income {
    pub id: i64,
    pub description: String,
    pub amount: f64,
    pub source: Option<String>,
    pub date: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl SyncEntity for Income {
    const KIND: EntityKind = EntityKind::Incomes;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "description",
        "amount",
        "source",
        "date",
        "notes",
        "created_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(&self.description)
            .bind(self.amount)
            .bind(&self.source)
            .bind(&self.date)
            .bind(&self.notes)
            .bind(&self.created_at)
    }
}

/// A person expenses and debts can refer to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl SyncEntity for Person {
    const KIND: EntityKind = EntityKind::People;
    const COLUMNS: &'static [&'static str] =
        &["id", "name", "phone", "email", "notes", "created_at"];

    fn id(&self) -> i64 {
        self.id
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(&self.name)
            .bind(&self.phone)
            .bind(&self.email)
            .bind(&self.notes)
            .bind(&self.created_at)
    }
}

/// Debt record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Debt {
    pub id: i64,
    pub person_id: Option<i64>,
    pub description: String,
    pub amount: f64,
    pub kind: Option<String>,
    pub due_date: Option<String>,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub paid: bool,
    pub notes: Option<String>,
    pub created_at: String,
}

impl SyncEntity for Debt {
    const KIND: EntityKind = EntityKind::Debts;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "person_id",
        "description",
        "amount",
        "kind",
        "due_date",
        "paid",
        "notes",
        "created_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(self.person_id)
            .bind(&self.description)
            .bind(self.amount)
            .bind(&self.kind)
            .bind(&self.due_date)
            .bind(self.paid)
            .bind(&self.notes)
            .bind(&self.created_at)
    }
}

/// Stored credential. Read-only for paired devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Password {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    pub password: String,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl SyncEntity for Password {
    const KIND: EntityKind = EntityKind::Passwords;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "title",
        "username",
        "password",
        "url",
        "notes",
        "created_at",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }

    fn bind_columns<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.id)
            .bind(&self.title)
            .bind(&self.username)
            .bind(&self.password)
            .bind(&self.url)
            .bind(&self.notes)
            .bind(&self.created_at)
    }
}

/// Clients backed by SQLite send booleans as 0/1.
fn bool_or_int<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Repository for synced records
pub struct RecordRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RecordRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Read every row of one kind
    pub async fn fetch_all<T: SyncEntity>(&self) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id ASC",
            T::COLUMNS.join(", "),
            T::KIND.table()
        );

        let rows = sqlx::query_as::<_, T>(&sql).fetch_all(self.pool).await?;

        Ok(rows)
    }

    /// Read a single row by id
    pub async fn fetch_one<T: SyncEntity>(&self, id: i64) -> Result<Option<T>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            T::COLUMNS.join(", "),
            T::KIND.table()
        );

        let row = sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(row)
    }

    /// Insert the record, replacing any row with the same id
    pub async fn upsert<T: SyncEntity>(&self, record: &T) -> Result<()> {
        let placeholders = vec!["?"; T::COLUMNS.len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            T::KIND.table(),
            T::COLUMNS.join(", "),
            placeholders
        );

        record
            .bind_columns(sqlx::query(&sql))
            .execute(self.pool)
            .await?;

        Ok(())
    }

    /// Count rows of one kind
    pub async fn count(&self, kind: EntityKind) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(self.pool).await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;

    fn expense(id: i64, description: &str, created_at: &str) -> Expense {
        Expense {
            id,
            description: description.to_string(),
            amount: 4.5,
            category: Some("food".to_string()),
            date: None,
            person_id: None,
            notes: None,
            created_at: created_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let pool = create_memory_pool().await.unwrap();
        let repo = RecordRepository::new(&pool);

        repo.upsert(&expense(7, "Coffee", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let fetched: Option<Expense> = repo.fetch_one(7).await.unwrap();
        assert_eq!(fetched.unwrap().description, "Coffee");

        let missing: Option<Expense> = repo.fetch_one(8).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let pool = create_memory_pool().await.unwrap();
        let repo = RecordRepository::new(&pool);

        repo.upsert(&expense(7, "Coffee", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        repo.upsert(&expense(7, "Tea", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();

        let all: Vec<Expense> = repo.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description, "Tea");
        assert_eq!(repo.count(EntityKind::Expenses).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_debt_paid_flag_round_trips() {
        let pool = create_memory_pool().await.unwrap();
        let repo = RecordRepository::new(&pool);

        let debt: Debt = serde_json::from_value(serde_json::json!({
            "id": 3,
            "description": "Lunch",
            "amount": 12.0,
            "paid": 1,
            "created_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert!(debt.paid);

        repo.upsert(&debt).await.unwrap();
        let stored: Debt = repo.fetch_one(3).await.unwrap().unwrap();
        assert_eq!(stored, debt);
    }

    #[test]
    fn test_only_passwords_are_read_only() {
        let writable: Vec<_> = EntityKind::ALL
            .iter()
            .filter(|k| k.accepts_remote_writes())
            .collect();
        assert_eq!(writable.len(), 4);
        assert!(!EntityKind::Passwords.accepts_remote_writes());
    }
}
