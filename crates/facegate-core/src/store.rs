//! Identity store — enrolled reference embeddings.
//!
//! References persist in a SQLite database (`faces.db`). The gate loads them
//! once at startup into an [`IdentityStore`]; only the CLI writes.

use crate::types::{Embedding, ReferenceEmbedding};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    label         TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    enrolled_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identities_label ON identities(label);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity {id} has a corrupt embedding blob ({len} bytes)")]
    CorruptEmbedding { id: i64, len: usize },
    #[error("refusing to enroll an empty embedding")]
    EmptyEmbedding,
    #[error("label must not be empty")]
    EmptyLabel,
}

/// In-memory, insertion-ordered directory of reference embeddings.
#[derive(Debug, Default, Clone)]
pub struct IdentityStore {
    references: Vec<ReferenceEmbedding>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reference. The vector is L2-normalized on the way in.
    pub fn insert(&mut self, label: impl Into<String>, embedding: Embedding) {
        self.references.push(ReferenceEmbedding {
            label: label.into(),
            embedding: embedding.l2_normalized(),
        });
    }

    /// All references in insertion order.
    pub fn references(&self) -> &[ReferenceEmbedding] {
        &self.references
    }

    /// Distinct labels in first-enrolled order.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for r in &self.references {
            if !labels.contains(&r.label.as_str()) {
                labels.push(&r.label);
            }
        }
        labels
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// References not produced by `model_version`, including rows with no
    /// recorded model.
    pub fn foreign_references(&self, model_version: &str) -> Vec<&ReferenceEmbedding> {
        self.references
            .iter()
            .filter(|r| r.embedding.model_version.as_deref() != Some(model_version))
            .collect()
    }
}

/// Per-label summary for listing.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentitySummary {
    pub label: String,
    pub embeddings: usize,
    pub first_enrolled_at: String,
}

/// SQLite-backed persistence for enrolled identities.
pub struct FaceDb {
    conn: Connection,
}

impl FaceDb {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "opened face database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Store one reference embedding for `label`, returning its row id.
    pub fn enroll(&self, label: &str, embedding: &Embedding) -> Result<i64, StoreError> {
        if label.trim().is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        if embedding.values.is_empty() {
            return Err(StoreError::EmptyEmbedding);
        }

        let normalized = embedding.clone().l2_normalized();
        self.conn.execute(
            "INSERT INTO identities (label, embedding, model_version, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                label,
                encode_embedding(&normalized.values),
                normalized.model_version,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(id, label, dim = normalized.dim(), "enrolled reference embedding");
        Ok(id)
    }

    /// Delete every reference for `label`. Returns the number removed.
    pub fn remove(&self, label: &str) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM identities WHERE label = ?1", params![label])?;
        tracing::info!(label, removed, "removed identity");
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT label, COUNT(*), MIN(enrolled_at), MIN(id) AS first_id
             FROM identities GROUP BY label ORDER BY first_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentitySummary {
                label: row.get(0)?,
                embeddings: row.get::<_, i64>(1)? as usize,
                first_enrolled_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Load every reference, in enrollment order, into an [`IdentityStore`].
    ///
    /// Rows enrolled with an encoder other than `model_version` are kept but
    /// logged; their distances are not comparable.
    pub fn load(&self, model_version: &str) -> Result<IdentityStore, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, label, embedding, model_version FROM identities ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut store = IdentityStore::new();
        for row in rows {
            let (id, label, blob, enrolled_with) = row?;
            let values = decode_embedding(&blob).ok_or(StoreError::CorruptEmbedding {
                id,
                len: blob.len(),
            })?;
            store.insert(
                label,
                Embedding {
                    values,
                    model_version: enrolled_with,
                },
            );
        }

        for r in store.foreign_references(model_version) {
            tracing::warn!(
                label = %r.label,
                enrolled_with = r.embedding.model_version.as_deref().unwrap_or("<none>"),
                expected = model_version,
                "reference was enrolled with a different encoder model; re-enroll it"
            );
        }

        tracing::info!(
            references = store.len(),
            identities = store.labels().len(),
            "loaded identity store"
        );
        Ok(store)
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_normalizes_on_insert() {
        let mut store = IdentityStore::new();
        store.insert("A001", Embedding::new(vec![3.0, 4.0]));
        let v = &store.references()[0].embedding.values;
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_labels_keep_first_enrolled_order() {
        let mut store = IdentityStore::new();
        store.insert("B", Embedding::new(vec![1.0, 0.0]));
        store.insert("A", Embedding::new(vec![0.0, 1.0]));
        store.insert("B", Embedding::new(vec![1.0, 1.0]));
        assert_eq!(store.labels(), vec!["B", "A"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_enroll_and_load_preserves_order() {
        let db = FaceDb::open_in_memory().unwrap();
        db.enroll("A001", &Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        db.enroll("B002", &Embedding::new(vec![0.0, 2.0, 0.0])).unwrap();
        db.enroll("A001", &Embedding::new(vec![0.0, 0.0, 1.0])).unwrap();

        let store = db.load("facenet").unwrap();
        let labels: Vec<&str> = store.references().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["A001", "B002", "A001"]);
        assert_eq!(store.references()[1].embedding.values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_list_groups_by_label() {
        let db = FaceDb::open_in_memory().unwrap();
        db.enroll("A001", &Embedding::new(vec![1.0, 0.0])).unwrap();
        db.enroll("A001", &Embedding::new(vec![0.0, 1.0])).unwrap();
        db.enroll("B002", &Embedding::new(vec![1.0, 1.0])).unwrap();

        let list = db.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].label, "A001");
        assert_eq!(list[0].embeddings, 2);
        assert_eq!(list[1].label, "B002");
        assert_eq!(list[1].embeddings, 1);
    }

    #[test]
    fn test_remove_label() {
        let db = FaceDb::open_in_memory().unwrap();
        db.enroll("A001", &Embedding::new(vec![1.0, 0.0])).unwrap();
        db.enroll("A001", &Embedding::new(vec![0.0, 1.0])).unwrap();
        db.enroll("B002", &Embedding::new(vec![1.0, 1.0])).unwrap();

        assert_eq!(db.remove("A001").unwrap(), 2);
        assert_eq!(db.remove("missing").unwrap(), 0);
        assert_eq!(db.load("facenet").unwrap().labels(), vec!["B002"]);
    }

    #[test]
    fn test_enroll_rejects_empty_inputs() {
        let db = FaceDb::open_in_memory().unwrap();
        assert!(matches!(
            db.enroll("", &Embedding::new(vec![1.0])),
            Err(StoreError::EmptyLabel)
        ));
        assert!(matches!(
            db.enroll("A001", &Embedding::new(vec![])),
            Err(StoreError::EmptyEmbedding)
        ));
    }

    #[test]
    fn test_load_keeps_references_from_other_models() {
        let db = FaceDb::open_in_memory().unwrap();
        let mut facenet = Embedding::new(vec![1.0, 0.0]);
        facenet.model_version = Some("facenet".into());
        let mut arcface = Embedding::new(vec![0.0, 1.0]);
        arcface.model_version = Some("arcface".into());
        db.enroll("A001", &facenet).unwrap();
        db.enroll("B002", &arcface).unwrap();
        db.enroll("C003", &Embedding::new(vec![1.0, 1.0])).unwrap();

        let store = db.load("facenet").unwrap();
        assert_eq!(store.len(), 3);
        let foreign: Vec<&str> = store
            .foreign_references("facenet")
            .iter()
            .map(|r| r.label.as_str())
            .collect();
        assert_eq!(foreign, vec!["B002", "C003"]);
        assert_eq!(store.foreign_references("arcface").len(), 2);
    }

    #[test]
    fn test_corrupt_blob_is_reported() {
        let db = FaceDb::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO identities (label, embedding, enrolled_at) VALUES ('X', ?1, 'now')",
                params![vec![1u8, 2, 3]],
            )
            .unwrap();
        assert!(matches!(
            db.load("facenet"),
            Err(StoreError::CorruptEmbedding { len: 3, .. })
        ));
    }

    #[test]
    fn test_embedding_blob_encoding() {
        let values = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&values)), Some(values));
        assert_eq!(decode_embedding(&[]), None);
    }
}
