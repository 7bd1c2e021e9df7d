//! LMDB-backed cache transport.
//!
//! Uses the heed crate (Rust bindings for LMDB) as a memory-mapped CAS-token
//! store. Several processes on one host can share the environment directory.
//!
//! # Entry Format
//!
//! ```text
//! [version: u64 LE][expires_at_ms: i64 LE, 0 = never][kind: u8][payload]
//! ```
//!
//! Plain values keep their bytes as payload; hash entries keep a JSON field
//! map. Versions come from a sequence stored under a reserved meta key and are
//! bumped inside the same write transaction as the mutation they tag.
//!
//! # Thread Safety
//!
//! Every mutation and every [`Transaction`] runs inside one LMDB write
//! transaction; LMDB serializes writers, so preconditions and operations
//! are atomic with respect to other writers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use tablecache_core::{TableCacheError, TransportError};

use super::{
    expiry_millis, is_expired, parse_counter, CacheTransport, Precondition, Transaction,
    TransactionOp, VersionToken,
};

const SEQUENCE_KEY: &[u8] = b"\x00tablecache:version-seq";
const HEADER_LEN: usize = 17;
/// LMDB's compiled-in maximum key size.
const LMDB_MAX_KEY_SIZE: usize = 511;

/// Error type for LMDB transport operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTransportError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored bytes do not decode as an entry.
    #[error("Corrupt entry under {0}")]
    Corrupt(String),

    /// Value operation on a hash entry or the reverse.
    #[error("Wrong entry kind under {0}")]
    WrongKind(String),

    /// Hash field map could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbTransportError> for TransportError {
    fn from(e: LmdbTransportError) -> Self {
        match e {
            LmdbTransportError::Corrupt(_) | LmdbTransportError::Serialization(_) => {
                TransportError::Serialization {
                    reason: e.to_string(),
                }
            }
            other => TransportError::Backend {
                reason: other.to_string(),
            },
        }
    }
}

/// Convert LmdbTransportError to TableCacheError.
impl From<LmdbTransportError> for TableCacheError {
    fn from(e: LmdbTransportError) -> Self {
        TableCacheError::Transport(e.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Value = 0,
    Hash = 1,
}

#[derive(Debug, Clone)]
struct Frame {
    version: u64,
    expires_at_ms: i64,
    kind: EntryKind,
    payload: Vec<u8>,
}

impl Frame {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.expires_at_ms.to_le_bytes());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    fn decode(key: &[u8], bytes: &[u8]) -> Result<Self, LmdbTransportError> {
        let corrupt = || LmdbTransportError::Corrupt(String::from_utf8_lossy(key).into_owned());
        if bytes.len() < HEADER_LEN {
            return Err(corrupt());
        }
        let version = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| corrupt())?);
        let expires_at_ms = i64::from_le_bytes(bytes[8..16].try_into().map_err(|_| corrupt())?);
        let kind = match bytes[16] {
            0 => EntryKind::Value,
            1 => EntryKind::Hash,
            _ => return Err(corrupt()),
        };
        Ok(Self {
            version,
            expires_at_ms,
            kind,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    fn hash_fields(&self, key: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, LmdbTransportError> {
        if self.kind != EntryKind::Hash {
            return Err(LmdbTransportError::WrongKind(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| LmdbTransportError::Serialization(e.to_string()))
    }
}

/// LMDB-backed cache transport.
///
/// # Example
///
/// ```ignore
/// let transport = LmdbTransport::new("/var/cache/tablecache", 256)?;
/// let cache = TableCache::new(Arc::new(transport), TableCacheConfig::default())?;
/// ```
pub struct LmdbTransport {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
}

impl LmdbTransport {
    /// Open or create an LMDB transport.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbTransportError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbTransportError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTransportError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    /// Delete every expired entry. Returns how many were deleted.
    pub fn purge_expired(&self) -> Result<usize, LmdbTransportError> {
        let mut wtxn = self.write_txn()?;
        let mut expired = Vec::new();
        {
            let iter = self
                .db
                .iter(&wtxn)
                .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
            for result in iter {
                let Ok((key, bytes)) = result else { continue };
                if key == SEQUENCE_KEY {
                    continue;
                }
                if let Ok(frame) = Frame::decode(key, bytes) {
                    if is_expired(frame.expires_at_ms) {
                        expired.push(key.to_vec());
                    }
                }
            }
        }
        for key in &expired {
            self.db
                .delete(&mut wtxn, key)
                .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
        Ok(expired.len())
    }

    fn read_txn(&self) -> Result<RoTxn<'_>, LmdbTransportError> {
        self.env
            .read_txn()
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))
    }

    fn write_txn(&self) -> Result<RwTxn<'_>, LmdbTransportError> {
        self.env
            .write_txn()
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))
    }

    fn read_live(&self, txn: &RoTxn, key: &[u8]) -> Result<Option<Frame>, LmdbTransportError> {
        let bytes = self
            .db
            .get(txn, key)
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
        match bytes {
            Some(bytes) => {
                let frame = Frame::decode(key, bytes)?;
                if is_expired(frame.expires_at_ms) {
                    Ok(None)
                } else {
                    Ok(Some(frame))
                }
            }
            None => Ok(None),
        }
    }

    fn read_value(&self, txn: &RoTxn, key: &[u8]) -> Result<Option<Frame>, LmdbTransportError> {
        match self.read_live(txn, key)? {
            Some(frame) if frame.kind == EntryKind::Value => Ok(Some(frame)),
            Some(_) => Err(LmdbTransportError::WrongKind(
                String::from_utf8_lossy(key).into_owned(),
            )),
            None => Ok(None),
        }
    }

    fn read_hash(
        &self,
        txn: &RoTxn,
        key: &[u8],
    ) -> Result<Option<(Frame, BTreeMap<String, Vec<u8>>)>, LmdbTransportError> {
        match self.read_live(txn, key)? {
            Some(frame) => {
                let fields = frame.hash_fields(key)?;
                Ok(Some((frame, fields)))
            }
            None => Ok(None),
        }
    }

    fn next_version(&self, wtxn: &mut RwTxn) -> Result<u64, LmdbTransportError> {
        let current = self
            .db
            .get(wtxn, SEQUENCE_KEY)
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?
            .and_then(|bytes| bytes.try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0);
        let next = current + 1;
        self.db
            .put(wtxn, SEQUENCE_KEY, &next.to_le_bytes())
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
        Ok(next)
    }

    fn put_frame(&self, wtxn: &mut RwTxn, key: &[u8], frame: &Frame) -> Result<(), LmdbTransportError> {
        self.db
            .put(wtxn, key, &frame.encode())
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))
    }

    fn delete(&self, wtxn: &mut RwTxn, key: &[u8]) -> Result<bool, LmdbTransportError> {
        let existed = self.read_live(wtxn, key)?.is_some();
        self.db
            .delete(wtxn, key)
            .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
        Ok(existed)
    }

    fn put_hash(
        &self,
        wtxn: &mut RwTxn,
        key: &[u8],
        fields: &BTreeMap<String, Vec<u8>>,
        expires_at_ms: i64,
    ) -> Result<(), LmdbTransportError> {
        if fields.is_empty() {
            self.delete(wtxn, key)?;
            return Ok(());
        }
        let payload = serde_json::to_vec(fields)
            .map_err(|e| LmdbTransportError::Serialization(e.to_string()))?;
        let frame = Frame {
            version: self.next_version(wtxn)?,
            expires_at_ms,
            kind: EntryKind::Hash,
            payload,
        };
        self.put_frame(wtxn, key, &frame)
    }

    fn check(&self, txn: &RoTxn, precondition: &Precondition) -> Result<bool, LmdbTransportError> {
        Ok(match precondition {
            Precondition::KeyExists(key) => self.read_live(txn, key.as_bytes())?.is_some(),
            Precondition::KeyAbsent(key) => self.read_live(txn, key.as_bytes())?.is_none(),
            Precondition::VersionMatches(key, token) => self
                .read_live(txn, key.as_bytes())?
                .map(|frame| frame.version == token.as_u64())
                .unwrap_or(false),
            Precondition::HashFieldEquals { key, field, value } => {
                match self.read_live(txn, key.as_bytes())? {
                    Some(frame) if frame.kind == EntryKind::Hash => frame
                        .hash_fields(key.as_bytes())?
                        .get(field)
                        .map(|stored| stored == value)
                        .unwrap_or(false),
                    _ => false,
                }
            }
        })
    }

    fn apply(&self, wtxn: &mut RwTxn, op: &TransactionOp) -> Result<(), LmdbTransportError> {
        match op {
            TransactionOp::Set { key, value, ttl } => {
                let frame = Frame {
                    version: self.next_version(wtxn)?,
                    expires_at_ms: expiry_millis(*ttl),
                    kind: EntryKind::Value,
                    payload: value.clone(),
                };
                self.put_frame(wtxn, key.as_bytes(), &frame)
            }
            TransactionOp::Remove { key } => self.delete(wtxn, key.as_bytes()).map(|_| ()),
            TransactionOp::HashSet {
                key,
                field,
                value,
                ttl,
            } => {
                let mut fields = self
                    .read_hash(wtxn, key.as_bytes())?
                    .map(|(_, fields)| fields)
                    .unwrap_or_default();
                fields.insert(field.clone(), value.clone());
                self.put_hash(wtxn, key.as_bytes(), &fields, expiry_millis(*ttl))
            }
            TransactionOp::HashRemove { key, field } => {
                if let Some((frame, mut fields)) = self.read_hash(wtxn, key.as_bytes())? {
                    if fields.remove(field).is_some() {
                        self.put_hash(wtxn, key.as_bytes(), &fields, frame.expires_at_ms)?;
                    }
                }
                Ok(())
            }
            TransactionOp::HashIncrement { key, field, delta } => {
                self.increment(wtxn, key, field, *delta).map(|_| ())
            }
            TransactionOp::Expire { key, ttl } => {
                if let Some(mut frame) = self.read_live(wtxn, key.as_bytes())? {
                    frame.expires_at_ms = expiry_millis(*ttl);
                    self.put_frame(wtxn, key.as_bytes(), &frame)?;
                }
                Ok(())
            }
        }
    }

    fn increment(
        &self,
        wtxn: &mut RwTxn,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, LmdbTransportError> {
        let (expires_at_ms, mut fields) = match self.read_hash(wtxn, key.as_bytes())? {
            Some((frame, fields)) => (frame.expires_at_ms, fields),
            None => (0, BTreeMap::new()),
        };
        let current = match fields.get(field) {
            Some(raw) => parse_counter(key, field, raw)
                .map_err(|e| LmdbTransportError::Corrupt(e.to_string()))?,
            None => 0,
        };
        let next = current + delta;
        fields.insert(field.to_string(), next.to_string().into_bytes());
        self.put_hash(wtxn, key.as_bytes(), &fields, expires_at_ms)?;
        Ok(next)
    }

    /// Run `f` in a write transaction, committing only when it returns
    /// `Ok(true)`.
    fn write_with<F>(&self, f: F) -> Result<bool, LmdbTransportError>
    where
        F: FnOnce(&mut RwTxn) -> Result<bool, LmdbTransportError>,
    {
        let mut wtxn = self.write_txn()?;
        let applied = f(&mut wtxn)?;
        if applied {
            wtxn.commit()
                .map_err(|e| LmdbTransportError::Transaction(e.to_string()))?;
        }
        Ok(applied)
    }
}

#[async_trait]
impl CacheTransport for LmdbTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.get_with_version(key).await?.map(|(value, _)| value))
    }

    async fn get_with_version(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, VersionToken)>, TransportError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .read_value(&rtxn, key.as_bytes())?
            .map(|frame| (frame.payload, VersionToken::from_raw(frame.version))))
    }

    async fn add_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, TransportError> {
        let txn = self
            .begin_transaction()
            .add_precondition(Precondition::KeyAbsent(key.to_string()))
            .set(key, value.to_vec(), ttl);
        self.execute(txn).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, TransportError> {
        let txn = self.begin_transaction().set(key, value.to_vec(), ttl);
        self.execute(txn).await
    }

    async fn replace_if_version_matches(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        token: VersionToken,
    ) -> Result<bool, TransportError> {
        let txn = self
            .begin_transaction()
            .add_precondition(Precondition::VersionMatches(key.to_string(), token))
            .set(key, value.to_vec(), ttl);
        self.execute(txn).await
    }

    async fn remove(&self, key: &str) -> Result<bool, TransportError> {
        Ok(self.write_with(|wtxn| self.delete(wtxn, key.as_bytes()))?)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize, TransportError> {
        let mut removed = 0;
        self.write_with(|wtxn| {
            for key in keys {
                if self.delete(wtxn, key.as_bytes())? {
                    removed += 1;
                }
            }
            Ok(true)
        })?;
        Ok(removed)
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let txn = self
            .begin_transaction()
            .hash_set(key, field, value.to_vec(), ttl);
        self.execute(txn).await.map(|_| ())
    }

    async fn hash_remove_field(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        Ok(self.write_with(|wtxn| {
            let existed = self
                .read_hash(wtxn, key.as_bytes())?
                .map(|(_, fields)| fields.contains_key(field))
                .unwrap_or(false);
            self.apply(
                wtxn,
                &TransactionOp::HashRemove {
                    key: key.to_string(),
                    field: field.to_string(),
                },
            )?;
            Ok(existed)
        })?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, TransportError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .read_hash(&rtxn, key.as_bytes())?
            .map(|(_, fields)| fields.into_iter().collect())
            .unwrap_or_default())
    }

    async fn hash_field_exists(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .read_hash(&rtxn, key.as_bytes())?
            .map(|(_, fields)| fields.contains_key(field))
            .unwrap_or(false))
    }

    async fn hash_length(&self, key: &str) -> Result<usize, TransportError> {
        let rtxn = self.read_txn()?;
        Ok(self
            .read_hash(&rtxn, key.as_bytes())?
            .map(|(_, fields)| fields.len())
            .unwrap_or(0))
    }

    async fn hash_increment_field(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, TransportError> {
        let mut next = 0;
        self.write_with(|wtxn| {
            next = self.increment(wtxn, key, field, delta)?;
            Ok(true)
        })?;
        Ok(next)
    }

    async fn execute(&self, transaction: Transaction) -> Result<bool, TransportError> {
        Ok(self.write_with(|wtxn| {
            for precondition in transaction.preconditions() {
                if !self.check(wtxn, precondition)? {
                    return Ok(false);
                }
            }
            for op in transaction.operations() {
                self.apply(wtxn, op)?;
            }
            Ok(true)
        })?)
    }

    fn key_length_limit(&self) -> usize {
        LMDB_MAX_KEY_SIZE
    }
}
