use std::{collections::HashSet, path::Path};

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};
use tracing::{debug, warn};

use crate::error::Result;

const EMBEDDINGS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("chunk_embeddings");

/// Document owner -> concatenated 32-byte keys of its chunks.
const DOCUMENT_KEYS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("document_keys");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

const KEY_SIZE: usize = 32;

/// Cache key for one chunk: BLAKE3 over the model ID and chunk text.
pub fn embedding_key(model_id: &str, content: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(content.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Persistent store of chunk embeddings keyed by [`embedding_key`].
///
/// Lets a new process, or a rebuild after a small edit, reuse vectors for
/// chunks whose text has not changed. The keys each document last used are
/// recorded too, so vectors for text that was edited away can be dropped.
///
/// Binary format per entry:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
pub struct EmbeddingDb {
    db: Database,
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use policyseek::EmbeddingDb;
    ///
    /// let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
    /// assert_eq!(db.len().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_table(DOCUMENT_KEYS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Like [`open`](Self::open), but a database that is locked by another
    /// process or unreadable gives `None` and a warning. Searching works the
    /// same without the store, only slower.
    pub fn open_or_skip(path: &Path) -> Option<Self> {
        match Self::open(path) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "embedding cache unavailable, continuing without it"
                );
                None
            }
        }
    }

    /// Store several embeddings in a single transaction.
    pub fn batch_store(&self, entries: &[([u8; 32], Vec<f32>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            for (key, vector) in entries {
                let bytes = encode(vector);
                table.insert(key.as_slice(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Load several embeddings in a single transaction, preserving input
    /// order. Missing entries are `None`.
    pub fn batch_load(
        &self,
        keys: &[[u8; 32]],
    ) -> Result<Vec<Option<Vec<f32>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let vector = table
                .get(key.as_slice())?
                .and_then(|guard| decode(guard.value()));
            results.push(vector);
        }
        Ok(results)
    }

    /// Record `keys` as the chunks of `document` and delete the embeddings
    /// it used before that neither it nor any other document uses now.
    ///
    /// Returns how many embeddings were removed.
    pub fn replace_document_keys(
        &self,
        document: &str,
        keys: &[[u8; 32]],
    ) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut documents = txn.open_table(DOCUMENT_KEYS)?;
            let previous = documents
                .get(document)?
                .map(|guard| decode_keys(guard.value()))
                .unwrap_or_default();
            documents.insert(document, keys.concat().as_slice())?;

            let mut unused: HashSet<[u8; 32]> = previous.into_iter().collect();
            for key in keys {
                unused.remove(key);
            }
            if !unused.is_empty() {
                for entry in documents.iter()? {
                    let (_, value) = entry?;
                    for key in decode_keys(value.value()) {
                        unused.remove(&key);
                    }
                }
            }

            let mut embeddings = txn.open_table(EMBEDDINGS)?;
            let mut removed = 0;
            for key in &unused {
                if embeddings.remove(key.as_slice())?.is_some() {
                    removed += 1;
                }
            }
            removed
        };
        txn.commit()?;

        if removed > 0 {
            debug!(document, removed, "pruned unused embeddings");
        }
        Ok(removed)
    }

    /// Number of stored embeddings.
    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table.len()?)
    }

    /// Number of documents whose chunk keys are recorded.
    pub fn document_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENT_KEYS)?;
        Ok(table.len()?)
    }

    /// Remove every stored embedding and document record. Returns how many
    /// embeddings were removed.
    pub fn clear(&self) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(EMBEDDINGS)?;
            let count = table.len()?;
            table.retain(|_, _| false)?;
            txn.open_table(DOCUMENT_KEYS)?.retain(|_, _| false)?;
            count
        };
        txn.commit()?;
        Ok(removed)
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}

fn encode(vector: &[f32]) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(vector));
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(vector));
    bytes
}

fn decode_keys(bytes: &[u8]) -> Vec<[u8; 32]> {
    bytes
        .chunks_exact(KEY_SIZE)
        .filter_map(|key| key.try_into().ok())
        .collect()
}

fn decode(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != dimension * 4 {
        return None;
    }
    Some(
        body.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, EmbeddingDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
        (tmp, db)
    }

    fn load_one(db: &EmbeddingDb, key: [u8; 32]) -> Option<Vec<f32>> {
        db.batch_load(&[key]).unwrap().remove(0)
    }

    #[test]
    fn store_and_load() {
        let (_tmp, db) = test_db();
        let key = embedding_key("hash-4", "Hotels need WiFi.");
        let vector = vec![0.1, 0.2, 0.3, 0.4];

        db.batch_store(&[(key, vector.clone())]).unwrap();
        assert_eq!(load_one(&db, key), Some(vector));
    }

    #[test]
    fn load_missing_returns_none() {
        let (_tmp, db) = test_db();
        assert!(load_one(&db, embedding_key("m", "nothing")).is_none());
    }

    #[test]
    fn key_depends_on_model_and_content() {
        let a = embedding_key("model-a", "text");
        assert_eq!(a, embedding_key("model-a", "text"));
        assert_ne!(a, embedding_key("model-b", "text"));
        assert_ne!(a, embedding_key("model-a", "text "));
        assert_ne!(embedding_key("ab", "c"), embedding_key("a", "bc"));
    }

    #[test]
    fn batch_load_preserves_order() {
        let (_tmp, db) = test_db();
        let k1 = embedding_key("m", "one");
        let k2 = embedding_key("m", "two");
        let missing = embedding_key("m", "three");

        db.batch_store(&[(k1, vec![1.0]), (k2, vec![2.0])]).unwrap();

        let loaded = db.batch_load(&[k2, missing, k1]).unwrap();
        assert_eq!(loaded, vec![Some(vec![2.0]), None, Some(vec![1.0])]);
    }

    #[test]
    fn overwrite_entry() {
        let (_tmp, db) = test_db();
        let key = embedding_key("m", "text");
        db.batch_store(&[(key, vec![1.0, 2.0])]).unwrap();
        db.batch_store(&[(key, vec![3.0, 4.0, 5.0])]).unwrap();
        assert_eq!(load_one(&db, key), Some(vec![3.0, 4.0, 5.0]));
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let (_tmp, db) = test_db();
        let a = embedding_key("m", "a");
        let b = embedding_key("m", "b");
        db.batch_store(&[(a, vec![1.0]), (b, vec![2.0])]).unwrap();
        db.replace_document_keys("policies.txt", &[a, b]).unwrap();

        assert_eq!(db.clear().unwrap(), 2);
        assert_eq!(db.len().unwrap(), 0);
        assert_eq!(db.document_count().unwrap(), 0);
    }

    #[test]
    fn replaced_keys_are_pruned() {
        let (_tmp, db) = test_db();
        let kept = embedding_key("m", "kept");
        let edited = embedding_key("m", "edited away");
        let added = embedding_key("m", "added");
        db.batch_store(&[(kept, vec![1.0]), (edited, vec![2.0])]).unwrap();
        assert_eq!(db.replace_document_keys("doc", &[kept, edited]).unwrap(), 0);

        db.batch_store(&[(added, vec![3.0])]).unwrap();
        assert_eq!(db.replace_document_keys("doc", &[kept, added]).unwrap(), 1);

        assert_eq!(db.len().unwrap(), 2);
        assert!(load_one(&db, edited).is_none());
        assert_eq!(load_one(&db, kept), Some(vec![1.0]));
        assert_eq!(db.document_count().unwrap(), 1);
    }

    #[test]
    fn keys_shared_with_another_document_survive() {
        let (_tmp, db) = test_db();
        let shared = embedding_key("m", "Travel insurance is mandatory.");
        let only_a = embedding_key("m", "Economy class only.");
        db.batch_store(&[(shared, vec![1.0]), (only_a, vec![2.0])]).unwrap();
        db.replace_document_keys("a", &[shared, only_a]).unwrap();
        db.replace_document_keys("b", &[shared]).unwrap();

        assert_eq!(db.replace_document_keys("a", &[]).unwrap(), 1);
        assert_eq!(load_one(&db, shared), Some(vec![1.0]));
        assert!(load_one(&db, only_a).is_none());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        let key = embedding_key("m", "persisted");

        {
            let db = EmbeddingDb::open(&path).unwrap();
            db.batch_store(&[(key, vec![1.0, 2.0])]).unwrap();
        }

        {
            let db = EmbeddingDb::open(&path).unwrap();
            assert_eq!(load_one(&db, key), Some(vec![1.0, 2.0]));
        }
    }

    #[test]
    fn open_or_skip_tolerates_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        std::fs::write(&path, b"not a database".repeat(64)).unwrap();

        assert!(EmbeddingDb::open(&path).is_err());
        assert!(EmbeddingDb::open_or_skip(&path).is_none());
    }

    #[test]
    fn open_or_skip_tolerates_locked_database() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");
        let _held = EmbeddingDb::open(&path).unwrap();

        assert!(EmbeddingDb::open_or_skip(&path).is_none());
    }

    #[test]
    fn malformed_entry_decodes_to_none() {
        assert!(decode(&[1, 0]).is_none());
        assert!(decode(&[2, 0, 0, 0, 0, 0, 128, 63]).is_none());
        assert_eq!(decode(&[1, 0, 0, 0, 0, 0, 128, 63]), Some(vec![1.0]));
    }
}
