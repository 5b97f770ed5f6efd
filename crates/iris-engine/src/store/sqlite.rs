use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iris_core::Template;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;

use super::{
    new_template_id, EnrollPolicy, IdentityRecord, StoreError, StoredTemplate, TemplateId,
    TemplateStore,
};

const NONCE_LEN: usize = 12;

/// SQLite-backed template storage with AES-256-GCM encryption.
///
/// Templates are encrypted before storage and decrypted on retrieval.
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600). All statements run on one background
/// connection, so writes are serialized; each upsert is one
/// `BEGIN IMMEDIATE` transaction.
#[derive(Clone)]
pub struct SqliteTemplateStore {
    conn: Connection,
    enc_key: [u8; 32],
}

enum UpsertOutcome {
    Stored,
    AlreadyEnrolled,
}

type TemplateRow = (String, Vec<u8>, String);
type IdentityRow = (String, Option<String>);

impl SqliteTemplateStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");
        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
        }

        let enc_key = if in_memory {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS identities (
                     identity TEXT PRIMARY KEY,
                     created_at TEXT NOT NULL,
                     last_verified_at TEXT
                 );
                 CREATE TABLE IF NOT EXISTS templates (
                     seq INTEGER PRIMARY KEY AUTOINCREMENT,
                     id TEXT NOT NULL UNIQUE,
                     identity TEXT NOT NULL
                         REFERENCES identities(identity) ON DELETE CASCADE,
                     template BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_templates_identity ON templates(identity);",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), "template store opened");
        Ok(Self { conn, enc_key })
    }

    async fn template_rows(&self, identity: &str) -> Result<Vec<TemplateRow>, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, template, created_at FROM templates
                     WHERE identity = ?1 ORDER BY seq",
                )?;
                let rows = stmt.query_map([&identity], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    fn decode_rows(&self, rows: Vec<TemplateRow>) -> Result<Vec<StoredTemplate>, StoreError> {
        rows.into_iter()
            .map(|(id, blob, created_at)| {
                Ok(StoredTemplate {
                    id,
                    template: self.decrypt_template(&blob)?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_template(&self, template: &Template) -> Result<Vec<u8>, StoreError> {
        let plaintext = template.to_bytes();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_template(&self, blob: &[u8]) -> Result<Template, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;
        Template::from_bytes(&plaintext).map_err(StoreError::CorruptTemplate)
    }
}

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    async fn upsert(
        &self,
        identity: &str,
        template: &Template,
        policy: EnrollPolicy,
    ) -> Result<TemplateId, StoreError> {
        let id = new_template_id();
        let created_at = Utc::now().to_rfc3339();
        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_template(template)?;

        let id_clone = id.clone();
        let identity_owned = identity.to_string();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing: u64 = tx.query_row(
                    "SELECT COUNT(*) FROM templates WHERE identity = ?1",
                    [&identity_owned],
                    |row| row.get(0),
                )?;
                if existing > 0 {
                    match policy {
                        EnrollPolicy::Single => return Ok(UpsertOutcome::AlreadyEnrolled),
                        EnrollPolicy::Replace => {
                            tx.execute(
                                "DELETE FROM templates WHERE identity = ?1",
                                [&identity_owned],
                            )?;
                        }
                        EnrollPolicy::Append => {}
                    }
                }
                tx.execute(
                    "INSERT OR IGNORE INTO identities (identity, created_at) VALUES (?1, ?2)",
                    rusqlite::params![identity_owned, created_at],
                )?;
                tx.execute(
                    "INSERT INTO templates (id, identity, template, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id_clone, identity_owned, blob, created_at],
                )?;
                tx.commit()?;
                Ok(UpsertOutcome::Stored)
            })
            .await?;

        match outcome {
            UpsertOutcome::Stored => Ok(id),
            UpsertOutcome::AlreadyEnrolled => Err(StoreError::AlreadyEnrolled(identity.to_string())),
        }
    }

    async fn get(&self, identity: &str) -> Result<Vec<StoredTemplate>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows = self.template_rows(identity).await?;
        self.decode_rows(rows)
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT 1 FROM templates WHERE identity = ?1 LIMIT 1",
                        [&identity],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn record(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let key = identity.to_string();
        // One read snapshot for the identity row and its templates
        let fetched: Option<(IdentityRow, Vec<TemplateRow>)> = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let head = tx
                    .query_row(
                        "SELECT created_at, last_verified_at FROM identities WHERE identity = ?1",
                        [&key],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                    )
                    .optional()?;
                let Some(head) = head else {
                    return Ok(None);
                };
                let templates = {
                    let mut stmt = tx.prepare(
                        "SELECT id, template, created_at FROM templates
                         WHERE identity = ?1 ORDER BY seq",
                    )?;
                    let rows = stmt.query_map([&key], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };
                tx.commit()?;
                Ok(Some((head, templates)))
            })
            .await?;

        let Some(((created_at, last_verified_at), rows)) = fetched else {
            return Ok(None);
        };
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(IdentityRecord {
            identity: identity.to_string(),
            templates: self.decode_rows(rows)?,
            created_at: parse_time(&created_at)?,
            last_verified_at: last_verified_at.as_deref().map(parse_time).transpose()?,
        }))
    }

    async fn identities(&self) -> Result<Vec<String>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT identity FROM templates ORDER BY identity",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn mark_verified(&self, identity: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        let at = at.to_rfc3339();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE identities SET last_verified_at = ?1 WHERE identity = ?2",
                    [&at, &identity],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn remove_template(&self, identity: &str, id: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let affected = tx.execute(
                    "DELETE FROM templates WHERE id = ?1 AND identity = ?2",
                    [&id, &identity],
                )?;
                tx.execute(
                    "DELETE FROM identities WHERE identity = ?1
                     AND NOT EXISTS (SELECT 1 FROM templates WHERE identity = ?1)",
                    [&identity],
                )?;
                tx.commit()?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn remove_identity(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let affected =
                    conn.execute("DELETE FROM identities WHERE identity = ?1", [&identity])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn count_templates(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM templates", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord(format!("bad timestamp {s:?}: {e}")))
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut f = options.open(key_path).map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::random_template;

    async fn memory_store() -> SqliteTemplateStore {
        SqliteTemplateStore::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = memory_store().await;
        let template = random_template(1);
        let id = store
            .upsert("alice", &template, EnrollPolicy::Append)
            .await
            .unwrap();
        assert!(!id.is_empty());

        let stored = store.get("alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].template, template);
        assert!(store.exists("alice").await.unwrap());
        assert!(!store.exists("bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_policies() {
        let store = memory_store().await;
        store
            .upsert("alice", &random_template(1), EnrollPolicy::Single)
            .await
            .unwrap();
        let err = store
            .upsert("alice", &random_template(2), EnrollPolicy::Single)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyEnrolled(_)));

        store
            .upsert("alice", &random_template(3), EnrollPolicy::Append)
            .await
            .unwrap();
        assert_eq!(store.get("alice").await.unwrap().len(), 2);

        let id = store
            .upsert("alice", &random_template(4), EnrollPolicy::Replace)
            .await
            .unwrap();
        let stored = store.get("alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].template, random_template(4));
    }

    #[tokio::test]
    async fn test_cross_identity_protection() {
        let store = memory_store().await;
        let id = store
            .upsert("alice", &random_template(1), EnrollPolicy::Append)
            .await
            .unwrap();

        assert!(store.get("bob").await.unwrap().is_empty());
        assert!(!store.remove_template("bob", &id).await.unwrap());
        assert!(store.remove_template("alice", &id).await.unwrap());
        assert!(store.get("alice").await.unwrap().is_empty());
        assert!(store.record("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_and_mark_verified() {
        let store = memory_store().await;
        store
            .upsert("alice", &random_template(1), EnrollPolicy::Append)
            .await
            .unwrap();
        let record = store.record("alice").await.unwrap().unwrap();
        assert_eq!(record.identity, "alice");
        assert!(record.last_verified_at.is_none());

        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(store.mark_verified("alice", at).await.unwrap());
        assert!(!store.mark_verified("bob", at).await.unwrap());
        let record = store.record("alice").await.unwrap().unwrap();
        assert_eq!(record.last_verified_at, Some(at));
    }

    #[tokio::test]
    async fn test_identities_and_count() {
        let store = memory_store().await;
        for (name, seed) in [("carol", 1), ("alice", 2), ("alice", 3)] {
            store
                .upsert(name, &random_template(seed), EnrollPolicy::Append)
                .await
                .unwrap();
        }
        assert_eq!(store.identities().await.unwrap(), ["alice", "carol"]);
        assert_eq!(store.count_templates().await.unwrap(), 3);
        assert!(store.remove_identity("alice").await.unwrap());
        assert_eq!(store.count_templates().await.unwrap(), 1);
        assert_eq!(store.identities().await.unwrap(), ["carol"]);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        // Encrypt with one key, decrypt with another
        let store1 = SqliteTemplateStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = SqliteTemplateStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };
        let blob = store1.encrypt_template(&random_template(5)).unwrap();
        assert!(matches!(
            store2.decrypt_template(&blob),
            Err(StoreError::DecryptionFailed)
        ));
        assert!(matches!(
            store1.decrypt_template(&blob[..8]),
            Err(StoreError::InvalidBlob(8))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_only_that_identity() {
        let store = memory_store().await;
        store
            .upsert("alice", &random_template(1), EnrollPolicy::Append)
            .await
            .unwrap();
        store
            .upsert("bob", &random_template(2), EnrollPolicy::Append)
            .await
            .unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "UPDATE templates SET template = x'00112233445566778899aabbccddeeff'
                     WHERE identity = 'alice'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.get("alice").await.is_err());
        assert_eq!(store.get("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_key_file_created_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("templates.db");
        let template = random_template(9);
        {
            let store = SqliteTemplateStore::open(&db).await.unwrap();
            store
                .upsert("alice", &template, EnrollPolicy::Append)
                .await
                .unwrap();
        }
        let key_path = dir.path().join(".key");
        assert_eq!(std::fs::read(&key_path).unwrap().len(), 32);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reopened = SqliteTemplateStore::open(&db).await.unwrap();
        assert_eq!(reopened.get("alice").await.unwrap()[0].template, template);
    }
}
