//! # Strongbox Storage - SQLite Backend
//!
//! SQLite implementation of the key registry. Uniqueness rules are enforced
//! with partial and expression indexes, so concurrent writers from several
//! processes sharing the database file observe the same invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use strongbox_storage::{
    AuditRecord, DekRecord, KekRecord, KeyRegistry, KeyWrapping, NewAuditRecord, StorageError,
};

// ============================================================================
// SQL Schema
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS keks (
    id              TEXT PRIMARY KEY,
    key_name        TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_keks_single_active ON keks (status) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS deks (
    id              TEXT PRIMARY KEY,
    kek_id          TEXT NOT NULL,
    wrapped_key     BLOB NOT NULL,
    wrap_algorithm  TEXT NOT NULL,
    algorithm       TEXT NOT NULL,
    domain          TEXT NOT NULL,
    tenant_id       TEXT,
    active          INTEGER NOT NULL DEFAULT 1,
    usage_count     INTEGER NOT NULL DEFAULT 0,
    last_used_at    INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_deks_active_scope ON deks (domain, IFNULL(tenant_id, '')) WHERE active = 1;

CREATE INDEX IF NOT EXISTS idx_deks_domain ON deks (domain);

CREATE TABLE IF NOT EXISTS audit_log (
    sequence        INTEGER PRIMARY KEY AUTOINCREMENT,
    operation       TEXT NOT NULL,
    resource_type   TEXT NOT NULL,
    resource_id     TEXT NOT NULL,
    actor           TEXT NOT NULL,
    actor_origin    TEXT,
    timestamp       INTEGER NOT NULL,
    entry_hash      TEXT NOT NULL,
    previous_hash   TEXT,
    signature       TEXT,
    signing_key_id  TEXT,
    metadata        TEXT NOT NULL,
    status          TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_predecessor ON audit_log (IFNULL(previous_hash, ''))
"#;

const DEK_COLUMNS: &str = "id, kek_id, wrapped_key, wrap_algorithm, algorithm, domain, tenant_id, active, usage_count, last_used_at, created_at, updated_at";

const AUDIT_COLUMNS: &str = "sequence, operation, resource_type, resource_id, actor, actor_origin, timestamp, entry_hash, previous_hash, signature, signing_key_id, metadata, status";

type KekRow = (String, String, String, i64);

type DekRow = (
    String,
    String,
    Vec<u8>,
    String,
    String,
    String,
    Option<String>,
    bool,
    i64,
    Option<i64>,
    i64,
    i64,
);

type AuditRow = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

// ============================================================================
// Row decoding
// ============================================================================

fn kek_from_row(row: KekRow) -> Result<KekRecord, StorageError> {
    let (id, key_name, status, created_at) = row;
    Ok(KekRecord {
        id,
        key_name,
        status: status.parse()?,
        created_at: created_at as u64,
    })
}

fn dek_from_row(row: DekRow) -> DekRecord {
    let (
        id,
        kek_id,
        wrapped_key,
        wrap_algorithm,
        algorithm,
        domain,
        tenant_id,
        active,
        usage_count,
        last_used_at,
        created_at,
        updated_at,
    ) = row;

    DekRecord {
        id,
        wrapping: KeyWrapping::from_kek_id(&kek_id),
        wrapped_key,
        wrap_algorithm,
        algorithm,
        domain,
        tenant_id,
        active,
        usage_count: usage_count as u64,
        last_used_at: last_used_at.map(|t| t as u64),
        created_at: created_at as u64,
        updated_at: updated_at as u64,
    }
}

fn audit_from_row(row: AuditRow) -> Result<AuditRecord, StorageError> {
    let (
        sequence,
        operation,
        resource_type,
        resource_id,
        actor,
        actor_origin,
        timestamp,
        entry_hash,
        previous_hash,
        signature,
        signing_key_id,
        metadata,
        status,
    ) = row;

    Ok(AuditRecord {
        sequence: sequence as u64,
        operation: operation.parse()?,
        resource_type: resource_type.parse()?,
        resource_id,
        actor,
        actor_origin,
        timestamp: timestamp as u64,
        entry_hash,
        previous_hash,
        signature,
        signing_key_id,
        metadata,
        status: status.parse()?,
    })
}

/// Maps a sqlx error, turning uniqueness violations into `AlreadyExists`.
fn map_err(e: sqlx::Error, what: &str) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::AlreadyExists(what.to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::ConnectionFailed(e.to_string())
        }
        _ => StorageError::QueryFailed(e.to_string()),
    }
}

// ============================================================================
// SQLite Registry
// ============================================================================

/// SQLite-backed [`KeyRegistry`].
///
/// The database lives at `{base_path}/{name}.db`.
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteRegistry {
    /// Opens or creates a registry database.
    ///
    /// # Arguments
    ///
    /// * `base_path` - Directory where the database is stored
    /// * `name` - Database name (must match `[a-z0-9_-]+`)
    pub async fn open(base_path: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        Self::validate_name(name)?;

        let base = base_path.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
        })?;

        let db_path = base.join(format!("{name}.db"));
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        debug!(path = %db_path.display(), "Opening SQLite registry");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let registry = Self { pool, db_path };
        registry.execute_raw(SCHEMA).await?;

        info!(path = %registry.db_path.display(), "SQLite registry ready");

        Ok(registry)
    }

    /// Only allows lowercase letters, digits, underscore and hyphen.
    fn validate_name(name: &str) -> Result<(), StorageError> {
        if name.is_empty() || name.len() > 64 {
            return Err(StorageError::InvalidInput(
                "database name must be 1-64 characters".into(),
            ));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !valid {
            return Err(StorageError::InvalidInput(
                "database name must match [a-z0-9_-]+".into(),
            ));
        }

        Ok(())
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Executes raw SQL statements separated by `;`.
    pub async fn execute_raw(&self, sql: &str) -> Result<(), StorageError> {
        for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement.trim())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::QueryFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Executes a single SQL statement with text parameters.
    ///
    /// Intended for operator maintenance; the registry methods cover normal use.
    pub async fn execute(&self, sql: &str, params: &[&str]) -> Result<u64, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_err(e, "row"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KeyRegistry for SqliteRegistry {
    async fn active_kek(&self) -> Result<Option<KekRecord>, StorageError> {
        let row: Option<KekRow> = sqlx::query_as(
            "SELECT id, key_name, status, created_at FROM keks WHERE status = 'active'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err(e, "kek"))?;

        row.map(kek_from_row).transpose()
    }

    async fn get_kek(&self, id: &str) -> Result<Option<KekRecord>, StorageError> {
        let row: Option<KekRow> =
            sqlx::query_as("SELECT id, key_name, status, created_at FROM keks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_err(e, "kek"))?;

        row.map(kek_from_row).transpose()
    }

    async fn insert_kek(&self, kek: &KekRecord) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err(e, "kek"))?;

        if kek.status == strongbox_storage::KekStatus::Active {
            sqlx::query("UPDATE keks SET status = 'retired' WHERE status = 'active'")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_err(e, "kek"))?;
        }

        sqlx::query("INSERT INTO keks (id, key_name, status, created_at) VALUES (?, ?, ?, ?)")
            .bind(&kek.id)
            .bind(&kek.key_name)
            .bind(kek.status.as_str())
            .bind(kek.created_at as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err(e, &format!("kek {}", kek.id)))?;

        tx.commit().await.map_err(|e| map_err(e, "kek"))?;

        debug!(kek_id = %kek.id, status = %kek.status, "KEK stored");
        Ok(())
    }

    async fn find_active_dek(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<DekRecord>, StorageError> {
        let sql = format!(
            "SELECT {DEK_COLUMNS} FROM deks WHERE domain = ? AND IFNULL(tenant_id, '') = IFNULL(?, '') AND active = 1"
        );
        let row: Option<DekRow> = sqlx::query_as(&sql)
            .bind(domain)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err(e, "dek"))?;

        Ok(row.map(dek_from_row))
    }

    async fn get_dek(&self, id: &str) -> Result<Option<DekRecord>, StorageError> {
        let sql = format!("SELECT {DEK_COLUMNS} FROM deks WHERE id = ?");
        let row: Option<DekRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err(e, "dek"))?;

        Ok(row.map(dek_from_row))
    }

    async fn list_active_deks(&self, domain: &str) -> Result<Vec<DekRecord>, StorageError> {
        let sql = format!(
            "SELECT {DEK_COLUMNS} FROM deks WHERE domain = ? AND active = 1 ORDER BY created_at, id"
        );
        let rows: Vec<DekRow> = sqlx::query_as(&sql)
            .bind(domain)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(e, "dek"))?;

        Ok(rows.into_iter().map(dek_from_row).collect())
    }

    async fn insert_dek(&self, dek: &DekRecord) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO deks ({DEK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&dek.id)
            .bind(dek.wrapping.kek_id())
            .bind(&dek.wrapped_key)
            .bind(&dek.wrap_algorithm)
            .bind(&dek.algorithm)
            .bind(&dek.domain)
            .bind(dek.tenant_id.as_deref())
            .bind(dek.active)
            .bind(dek.usage_count as i64)
            .bind(dek.last_used_at.map(|t| t as i64))
            .bind(dek.created_at as i64)
            .bind(dek.updated_at as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err(e, &format!("active dek for domain {}", dek.domain)))?;

        Ok(())
    }

    async fn update_dek_wrapping(
        &self,
        id: &str,
        wrapping: &KeyWrapping,
        wrapped_key: &[u8],
        wrap_algorithm: &str,
        updated_at: u64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE deks SET kek_id = ?, wrapped_key = ?, wrap_algorithm = ?, updated_at = ? WHERE id = ?",
        )
        .bind(wrapping.kek_id())
        .bind(wrapped_key)
        .bind(wrap_algorithm)
        .bind(updated_at as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err(e, "dek"))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("dek {id}")));
        }
        Ok(())
    }

    async fn record_dek_usage(&self, id: &str, used_at: u64) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE deks SET usage_count = usage_count + 1, last_used_at = ? WHERE id = ?",
        )
        .bind(used_at as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err(e, "dek"))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("dek {id}")));
        }
        Ok(())
    }

    async fn latest_audit_entry(&self) -> Result<Option<AuditRecord>, StorageError> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY sequence DESC LIMIT 1");
        let row: Option<AuditRow> = sqlx::query_as(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err(e, "audit entry"))?;

        row.map(audit_from_row).transpose()
    }

    async fn append_audit_entry(
        &self,
        entry: NewAuditRecord,
    ) -> Result<AuditRecord, StorageError> {
        let result = sqlx::query(
            "INSERT INTO audit_log (operation, resource_type, resource_id, actor, actor_origin, timestamp, entry_hash, previous_hash, signature, signing_key_id, metadata, status) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.operation.as_str())
        .bind(entry.resource_type.as_str())
        .bind(&entry.resource_id)
        .bind(&entry.actor)
        .bind(entry.actor_origin.as_deref())
        .bind(entry.timestamp as i64)
        .bind(&entry.entry_hash)
        .bind(entry.previous_hash.as_deref())
        .bind(entry.signature.as_deref())
        .bind(entry.signing_key_id.as_deref())
        .bind(&entry.metadata)
        .bind(entry.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_err(e, "audit entry with the same predecessor"))?;

        Ok(entry.with_sequence(result.last_insert_rowid() as u64))
    }

    async fn list_audit_entries(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE sequence > ? ORDER BY sequence LIMIT ?"
        );
        let rows: Vec<AuditRow> = sqlx::query_as(&sql)
            .bind(after as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(e, "audit entry"))?;

        rows.into_iter().map(audit_from_row).collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use strongbox_storage::{
        AuditOperation, AuditStatus, KekStatus, ResourceType, DEK_ALGORITHM,
    };
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteRegistry) {
        let tmp = TempDir::new().unwrap();
        let registry = SqliteRegistry::open(tmp.path(), "registry").await.unwrap();
        (tmp, registry)
    }

    fn dek(id: &str, domain: &str, tenant: Option<&str>) -> DekRecord {
        DekRecord {
            id: id.into(),
            wrapping: KeyWrapping::KeyService {
                kek_id: "kek-1".into(),
            },
            wrapped_key: vec![0x5A; 60],
            wrap_algorithm: "strongbox-local-v1".into(),
            algorithm: DEK_ALGORITHM.into(),
            domain: domain.into(),
            tenant_id: tenant.map(String::from),
            active: true,
            usage_count: 0,
            last_used_at: None,
            created_at: 100,
            updated_at: 100,
        }
    }

    fn audit(previous_hash: Option<&str>, hash: &str) -> NewAuditRecord {
        NewAuditRecord {
            operation: AuditOperation::Create,
            resource_type: ResourceType::Dek,
            resource_id: "d1".into(),
            actor: "tester".into(),
            actor_origin: Some("127.0.0.1".into()),
            timestamp: 5,
            entry_hash: hash.into(),
            previous_hash: previous_hash.map(String::from),
            signature: Some("c2ln".into()),
            signing_key_id: Some("kek-1".into()),
            metadata: r#"{"kind":"create"}"#.into(),
            status: AuditStatus::Success,
        }
    }

    #[tokio::test]
    async fn test_invalid_database_name() {
        let tmp = TempDir::new().unwrap();
        let result = SqliteRegistry::open(tmp.path(), "Bad Name").await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_kek_activation_retires_previous() {
        let (_tmp, registry) = setup().await;

        for id in ["k1", "k2"] {
            registry
                .insert_kek(&KekRecord {
                    id: id.into(),
                    key_name: format!("transit/{id}"),
                    status: KekStatus::Active,
                    created_at: 1,
                })
                .await
                .unwrap();
        }

        let active = registry.active_kek().await.unwrap().unwrap();
        assert_eq!(active.id, "k2");
        assert_eq!(active.key_name, "transit/k2");
        assert_eq!(
            registry.get_kek("k1").await.unwrap().unwrap().status,
            KekStatus::Retired
        );
        assert!(registry.get_kek("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dek_roundtrip() {
        let (_tmp, registry) = setup().await;
        let mut record = dek("d1", "documents", Some("acme"));
        record.wrapping = KeyWrapping::Fallback;
        registry.insert_dek(&record).await.unwrap();

        let stored = registry.get_dek("d1").await.unwrap().unwrap();
        assert_eq!(stored, record);

        let found = registry
            .find_active_dek("documents", Some("acme"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "d1");
        assert!(registry
            .find_active_dek("documents", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_active_dek_unique_per_scope_including_null_tenant() {
        let (_tmp, registry) = setup().await;

        registry.insert_dek(&dek("a", "documents", None)).await.unwrap();
        let result = registry.insert_dek(&dek("b", "documents", None)).await;
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));

        registry
            .insert_dek(&dek("c", "documents", Some("acme")))
            .await
            .unwrap();
        let result = registry
            .insert_dek(&dek("d", "documents", Some("acme")))
            .await;
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));

        let mut inactive = dek("e", "documents", None);
        inactive.active = false;
        registry.insert_dek(&inactive).await.unwrap();

        assert_eq!(registry.list_active_deks("documents").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_wrapping_and_usage() {
        let (_tmp, registry) = setup().await;
        registry.insert_dek(&dek("a", "documents", None)).await.unwrap();

        let wrapping = KeyWrapping::KeyService {
            kek_id: "kek-2".into(),
        };
        registry
            .update_dek_wrapping("a", &wrapping, &[9, 9, 9], "strongbox-local-v1", 200)
            .await
            .unwrap();
        registry.record_dek_usage("a", 300).await.unwrap();

        let stored = registry.get_dek("a").await.unwrap().unwrap();
        assert_eq!(stored.wrapping, wrapping);
        assert_eq!(stored.wrapped_key, vec![9, 9, 9]);
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.last_used_at, Some(300));
        assert_eq!(stored.updated_at, 200);

        let missing = registry
            .update_dek_wrapping("zzz", &wrapping, &[1], "x", 1)
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_audit_append_and_page() {
        let (_tmp, registry) = setup().await;

        let first = registry.append_audit_entry(audit(None, "h1")).await.unwrap();
        let second = registry
            .append_audit_entry(audit(Some("h1"), "h2"))
            .await
            .unwrap();
        registry
            .append_audit_entry(audit(Some("h2"), "h3"))
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.previous_hash.as_deref(), Some("h1"));

        let page = registry.list_audit_entries(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0], second);

        let latest = registry.latest_audit_entry().await.unwrap().unwrap();
        assert_eq!(latest.entry_hash, "h3");
    }

    #[tokio::test]
    async fn test_audit_rejects_forked_chain() {
        let (_tmp, registry) = setup().await;

        registry.append_audit_entry(audit(None, "h1")).await.unwrap();
        let second_genesis = registry.append_audit_entry(audit(None, "x")).await;
        assert!(matches!(second_genesis, Err(StorageError::AlreadyExists(_))));

        registry
            .append_audit_entry(audit(Some("h1"), "h2"))
            .await
            .unwrap();
        let fork = registry.append_audit_entry(audit(Some("h1"), "h3")).await;
        assert!(matches!(fork, Err(StorageError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let registry = SqliteRegistry::open(tmp.path(), "registry").await.unwrap();
            registry.insert_dek(&dek("a", "documents", None)).await.unwrap();
        }

        let registry = SqliteRegistry::open(tmp.path(), "registry").await.unwrap();
        assert!(registry.get_dek("a").await.unwrap().is_some());
    }
}
