//! Content-addressed blob stores.
//!
//! Blobs are keyed by `cid::compute(salt, bytes)`. Getters verify a blob
//! against its key whenever the caller supplies the salt it was posted
//! under. Backends: [`MemStore`] for in-process use, [`SqliteStore`] for an
//! embedded on-disk file, plus the [`UnionGetter`] and [`CowStore`]
//! combinators.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rusqlite::{Connection, DatabaseName, OpenFlags, OptionalExtension, params};
use tracing::trace;

use crate::cid::{self, Digest};
use crate::error::{Error, Result};

/// Largest blob a store accepts, in bits.
pub const MAX_BLOB_BITS: u32 = 1 << 24;
pub const MAX_BLOB_BYTES: usize = (MAX_BLOB_BITS / 8) as usize;

/// A bounded window over the key space for [`Store::list`].
#[derive(Clone, Copy, Debug)]
pub struct Span {
    /// List keys strictly greater than this one.
    pub after: Option<Digest>,
    pub limit: usize,
}

impl Span {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }
}

pub trait Getter: Send + Sync {
    /// Raw bytes stored under `key`, without verification.
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &Digest) -> Result<bool>;

    /// Bytes stored under `key`. When `salt` is given the blob is checked
    /// against the key and a mismatch is [`Error::BadData`].
    fn read(&self, key: &Digest, salt: Option<&Digest>) -> Result<Vec<u8>> {
        let data = self.fetch(key)?.ok_or(Error::NotFound(*key))?;
        if let Some(salt) = salt {
            verify(key, salt, &data)?;
        }
        Ok(data)
    }

    /// Copy the blob under `key` into `buf`, returning the bytes written.
    fn get(&self, key: &Digest, salt: Option<&Digest>, buf: &mut [u8]) -> Result<usize> {
        let data = self.read(key, salt)?;
        if data.len() > buf.len() {
            return Err(Error::Size(format!(
                "blob {} has {} bytes, buffer holds {}",
                cid::to_text(key),
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

pub trait Store: Getter {
    /// Store `data` under `hash(salt, data)`. Idempotent.
    fn post(&self, salt: Option<&Digest>, data: &[u8]) -> Result<Digest>;

    fn delete(&self, key: &Digest) -> Result<()>;

    /// Append up to `span.limit` keys after `span.after`, in key order.
    fn list(&self, span: &Span, out: &mut Vec<Digest>) -> Result<usize>;
}

/// Check that `data` hashes to `key` under `salt`.
pub fn verify(key: &Digest, salt: &Digest, data: &[u8]) -> Result<()> {
    let actual = cid::compute(Some(salt), data);
    if actual != *key {
        return Err(Error::BadData { key: *key, actual });
    }
    Ok(())
}

fn check_blob(data: &[u8]) -> Result<()> {
    if data.len() > MAX_BLOB_BYTES {
        return Err(Error::Size(format!(
            "blob of {} bytes exceeds the {MAX_BLOB_BYTES} byte limit",
            data.len()
        )));
    }
    Ok(())
}

impl<T: Getter + ?Sized> Getter for Arc<T> {
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        (**self).fetch(key)
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        (**self).exists(key)
    }
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn post(&self, salt: Option<&Digest>, data: &[u8]) -> Result<Digest> {
        (**self).post(salt, data)
    }

    fn delete(&self, key: &Digest) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, span: &Span, out: &mut Vec<Digest>) -> Result<usize> {
        (**self).list(span, out)
    }
}

/// In-memory store; tolerates concurrent readers.
#[derive(Debug, Default)]
pub struct MemStore {
    blobs: RwLock<BTreeMap<Digest, Arc<[u8]>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Getter for MemStore {
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(key).map(|b| b.to_vec()))
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.contains_key(key))
    }
}

impl Store for MemStore {
    fn post(&self, salt: Option<&Digest>, data: &[u8]) -> Result<Digest> {
        check_blob(data)?;
        let key = cid::compute(salt, data);
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        let inserted = !blobs.contains_key(&key);
        if inserted {
            blobs.insert(key, Arc::from(data));
        }
        trace!(key = %cid::to_text(&key), bytes = data.len(), inserted, "post");
        Ok(key)
    }

    fn delete(&self, key: &Digest) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.remove(key);
        Ok(())
    }

    fn list(&self, span: &Span, out: &mut Vec<Digest>) -> Result<usize> {
        use std::ops::Bound;
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        let lower = match &span.after {
            Some(after) => Bound::Excluded(*after),
            None => Bound::Unbounded,
        };
        let before = out.len();
        out.extend(
            blobs
                .range((lower, Bound::Unbounded))
                .take(span.limit)
                .map(|(k, _)| *k),
        );
        Ok(out.len() - before)
    }
}

pub fn derive_db_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(name);
    if path.extension().is_none() {
        path.set_extension("myc.db");
    }
    path
}

pub fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Blob store backed by an embedded SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a fresh store file; fails if one already exists.
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent_dirs(path)?;
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("store already exists at {}", path.display()),
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
        )?;
        Self::from_connection(conn)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store not found at {}", path.display()),
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        install_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure_pragmas(&conn)?;
        install_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }
}

pub fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(Some(DatabaseName::Main), "journal_mode", "WAL")?;
    conn.pragma_update(Some(DatabaseName::Main), "synchronous", "NORMAL")?;
    conn.pragma_update(Some(DatabaseName::Main), "temp_store", "MEMORY")?;
    conn.pragma_update(Some(DatabaseName::Main), "mmap_size", 268_435_456i64)?;
    Ok(())
}

pub fn install_schema(conn: &Connection) -> Result<()> {
    const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blob (
  key   BLOB PRIMARY KEY,
  data  BLOB NOT NULL
) WITHOUT ROWID;
"#;

    conn.execute_batch(SCHEMA)?;
    Ok(())
}

impl Getter for SqliteStore {
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT data FROM blob WHERE key = ?1",
                    params![&key[..]],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?)
        })
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM blob WHERE key = ?1",
                    params![&key[..]],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
    }
}

impl Store for SqliteStore {
    fn post(&self, salt: Option<&Digest>, data: &[u8]) -> Result<Digest> {
        check_blob(data)?;
        let key = cid::compute(salt, data);
        let rows = self.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO blob (key, data) VALUES (?1, ?2)",
                params![&key[..], data],
            )?)
        })?;
        trace!(key = %cid::to_text(&key), bytes = data.len(), inserted = rows > 0, "post");
        Ok(key)
    }

    fn delete(&self, key: &Digest) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM blob WHERE key = ?1", params![&key[..]])?;
            Ok(())
        })
    }

    fn list(&self, span: &Span, out: &mut Vec<Digest>) -> Result<usize> {
        let after = span.after.map(|a| a.to_vec()).unwrap_or_default();
        let limit = i64::try_from(span.limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM blob WHERE key > ?1 ORDER BY key LIMIT ?2")?;
            let rows = stmt.query_map(params![after, limit], |row| row.get::<_, Vec<u8>>(0))?;
            let mut count = 0;
            for row in rows {
                out.push(cid::from_slice(&row?)?);
                count += 1;
            }
            Ok(count)
        })
    }
}

/// Reads fan out across several getters; the first hit wins.
pub struct UnionGetter {
    parts: Vec<Arc<dyn Getter>>,
}

impl UnionGetter {
    pub fn new(parts: Vec<Arc<dyn Getter>>) -> Self {
        Self { parts }
    }
}

impl Getter for UnionGetter {
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        for part in &self.parts {
            if let Some(data) = part.fetch(key)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        for part in &self.parts {
            if part.exists(key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Copy-on-write: reads see `overlay` over a read-only `base`; writes and
/// deletes only touch `overlay`.
pub struct CowStore {
    overlay: Arc<dyn Store>,
    base: Arc<dyn Getter>,
}

impl CowStore {
    pub fn new(overlay: Arc<dyn Store>, base: Arc<dyn Getter>) -> Self {
        Self { overlay, base }
    }
}

impl Getter for CowStore {
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        match self.overlay.fetch(key)? {
            Some(data) => Ok(Some(data)),
            None => self.base.fetch(key),
        }
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        Ok(self.overlay.exists(key)? || self.base.exists(key)?)
    }
}

impl Store for CowStore {
    fn post(&self, salt: Option<&Digest>, data: &[u8]) -> Result<Digest> {
        check_blob(data)?;
        let key = cid::compute(salt, data);
        if self.base.exists(&key)? {
            return Ok(key);
        }
        self.overlay.post(salt, data)
    }

    fn delete(&self, key: &Digest) -> Result<()> {
        self.overlay.delete(key)
    }

    fn list(&self, span: &Span, out: &mut Vec<Digest>) -> Result<usize> {
        self.overlay.list(span, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Store) -> Result<()> {
        let a = store.post(None, b"alpha")?;
        assert_eq!(store.post(None, b"alpha")?, a);
        let salt = cid::compute(None, b"salt");
        let b = store.post(Some(&salt), b"alpha")?;
        assert_ne!(a, b);
        assert!(store.exists(&a)?);
        assert_eq!(store.read(&b, Some(&salt))?, b"alpha");
        assert!(matches!(store.read(&b, Some(&cid::NO_SALT)), Err(Error::BadData { .. })));

        let mut buf = [0u8; 8];
        assert_eq!(store.get(&a, Some(&cid::NO_SALT), &mut buf)?, 5);
        assert_eq!(&buf[..5], b"alpha");
        let mut small = [0u8; 2];
        assert!(matches!(store.get(&a, None, &mut small), Err(Error::Size(_))));

        let mut keys = Vec::new();
        assert_eq!(store.list(&Span::first(10), &mut keys)?, 2);
        let mut sorted = vec![a, b];
        sorted.sort();
        assert_eq!(keys, sorted);
        let mut rest = Vec::new();
        store.list(
            &Span {
                after: Some(sorted[0]),
                limit: 10,
            },
            &mut rest,
        )?;
        assert_eq!(rest, vec![sorted[1]]);

        store.delete(&a)?;
        assert!(!store.exists(&a)?);
        assert!(matches!(store.read(&a, None), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn mem_store_contract() -> Result<()> {
        exercise(&MemStore::new())
    }

    #[test]
    fn sqlite_store_contract() -> Result<()> {
        exercise(&SqliteStore::in_memory()?)
    }

    #[test]
    fn sqlite_store_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = derive_db_path(&dir.path().join("nested/pod").to_string_lossy());
        assert!(path.to_string_lossy().ends_with("pod.myc.db"));
        let key = {
            let store = SqliteStore::create(&path)?;
            store.post(None, b"persisted")?
        };
        assert!(SqliteStore::create(&path).is_err());
        let store = SqliteStore::open(&path)?;
        assert_eq!(store.read(&key, Some(&cid::NO_SALT))?, b"persisted");
        Ok(())
    }

    #[test]
    fn oversized_blobs_are_rejected() {
        let store = MemStore::new();
        let big = vec![0u8; MAX_BLOB_BYTES + 1];
        assert!(matches!(store.post(None, &big), Err(Error::Size(_))));
    }

    #[test]
    fn union_returns_first_hit() -> Result<()> {
        let left = Arc::new(MemStore::new());
        let right = Arc::new(MemStore::new());
        let a = left.post(None, b"left")?;
        let b = right.post(None, b"right")?;
        let union = UnionGetter::new(vec![left.clone() as Arc<dyn Getter>, right.clone()]);
        assert_eq!(union.read(&a, None)?, b"left");
        assert_eq!(union.read(&b, None)?, b"right");
        assert!(union.exists(&b)?);
        let missing = cid::compute(None, b"missing");
        assert!(matches!(union.read(&missing, None), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn cow_writes_only_to_overlay() -> Result<()> {
        let base = Arc::new(MemStore::new());
        let overlay = Arc::new(MemStore::new());
        let shared = base.post(None, b"shared")?;
        let cow = CowStore::new(overlay.clone(), base.clone());
        assert_eq!(cow.read(&shared, None)?, b"shared");
        assert_eq!(cow.post(None, b"shared")?, shared);
        assert!(overlay.is_empty());
        let fresh = cow.post(None, b"fresh")?;
        assert!(overlay.exists(&fresh)?);
        assert!(!base.exists(&fresh)?);
        cow.delete(&shared)?;
        assert!(cow.exists(&shared)?);
        Ok(())
    }
}
