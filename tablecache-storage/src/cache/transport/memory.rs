//! In-process transactional hash-map transport.
//!
//! Models a hash-oriented remote cache: every entry is a field map. A plain
//! value lives in the `payload` field next to a `generation` field; the
//! generation is drawn from a reserved sequence hash with the same increment
//! primitive that backs [`CacheTransport::hash_increment_field`]. Versioned
//! writes are transactions guarded by
//! [`Precondition::HashFieldEquals`] on the generation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tablecache_core::TransportError;

use super::{
    expiry_millis, is_expired, parse_counter, CacheTransport, Precondition, Transaction,
    TransactionOp, VersionToken, DEFAULT_KEY_LENGTH_LIMIT,
};

const SEQUENCE_KEY: &str = "\u{0}tablecache:sequence";
const SEQUENCE_FIELD: &str = "next";
const PAYLOAD_FIELD: &str = "payload";
const GENERATION_FIELD: &str = "generation";

#[derive(Debug, Clone, Default)]
struct HashEntry {
    fields: HashMap<String, Vec<u8>>,
    /// Unix millis, 0 = never.
    expires_at_ms: i64,
}

type Entries = HashMap<String, HashEntry>;

/// Hash-map backed cache transport shared by everything holding it.
#[derive(Debug)]
pub struct HashMapTransport {
    entries: Mutex<Entries>,
    key_length_limit: usize,
}

impl Default for HashMapTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HashMapTransport {
    pub fn new() -> Self {
        Self::with_key_length_limit(DEFAULT_KEY_LENGTH_LIMIT)
    }

    pub fn with_key_length_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            key_length_limit: limit,
        }
    }

    /// Number of live entries, excluding the internal sequence.
    pub fn entry_count(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|(k, e)| k.as_str() != SEQUENCE_KEY && !is_expired(e.expires_at_ms))
                .count(),
            Err(_) => 0,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, TransportError> {
        self.entries.lock().map_err(|_| TransportError::LockPoisoned)
    }
}

fn live<'a>(entries: &'a mut Entries, key: &str) -> Option<&'a mut HashEntry> {
    let expired = entries
        .get(key)
        .map(|e| is_expired(e.expires_at_ms))
        .unwrap_or(false);
    if expired {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn increment(entries: &mut Entries, key: &str, field: &str, delta: i64) -> Result<i64, TransportError> {
    let current = match live(entries, key).and_then(|e| e.fields.get(field)) {
        Some(raw) => parse_counter(key, field, raw)?,
        None => 0,
    };
    let next = current + delta;
    entries
        .entry(key.to_string())
        .or_default()
        .fields
        .insert(field.to_string(), next.to_string().into_bytes());
    Ok(next)
}

fn generation_of(entry: &HashEntry) -> Option<u64> {
    entry
        .fields
        .get(GENERATION_FIELD)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.parse().ok())
}

fn check(entries: &mut Entries, precondition: &Precondition) -> bool {
    match precondition {
        Precondition::KeyExists(key) => live(entries, key).is_some(),
        Precondition::KeyAbsent(key) => live(entries, key).is_none(),
        Precondition::VersionMatches(key, token) => live(entries, key)
            .and_then(|e| generation_of(e))
            .map(|generation| generation == token.as_u64())
            .unwrap_or(false),
        Precondition::HashFieldEquals { key, field, value } => live(entries, key)
            .and_then(|e| e.fields.get(field))
            .map(|stored| stored == value)
            .unwrap_or(false),
    }
}

fn apply(entries: &mut Entries, op: TransactionOp) -> Result<(), TransportError> {
    match op {
        TransactionOp::Set { key, value, ttl } => {
            let generation = increment(entries, SEQUENCE_KEY, SEQUENCE_FIELD, 1)?;
            let mut fields = HashMap::new();
            fields.insert(PAYLOAD_FIELD.to_string(), value);
            fields.insert(
                GENERATION_FIELD.to_string(),
                generation.to_string().into_bytes(),
            );
            entries.insert(
                key,
                HashEntry {
                    fields,
                    expires_at_ms: expiry_millis(ttl),
                },
            );
        }
        TransactionOp::Remove { key } => {
            entries.remove(&key);
        }
        TransactionOp::HashSet {
            key,
            field,
            value,
            ttl,
        } => {
            let _ = live(entries, &key);
            let entry = entries.entry(key).or_default();
            entry.fields.insert(field, value);
            entry.expires_at_ms = expiry_millis(ttl);
        }
        TransactionOp::HashRemove { key, field } => {
            if let Some(entry) = live(entries, &key) {
                entry.fields.remove(&field);
                if entry.fields.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        TransactionOp::HashIncrement { key, field, delta } => {
            increment(entries, &key, &field, delta)?;
        }
        TransactionOp::Expire { key, ttl } => {
            if let Some(entry) = live(entries, &key) {
                entry.expires_at_ms = expiry_millis(ttl);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl CacheTransport for HashMapTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.get_with_version(key).await?.map(|(value, _)| value))
    }

    async fn get_with_version(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, VersionToken)>, TransportError> {
        let mut entries = self.lock()?;
        let Some(entry) = live(&mut entries, key) else {
            return Ok(None);
        };
        match (entry.fields.get(PAYLOAD_FIELD), generation_of(entry)) {
            (Some(payload), Some(generation)) => {
                Ok(Some((payload.clone(), VersionToken::from_raw(generation))))
            }
            _ => Ok(None),
        }
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
            .add_precondition(Precondition::HashFieldEquals {
                key: key.to_string(),
                field: GENERATION_FIELD.to_string(),
                value: token.as_u64().to_string().into_bytes(),
            })
            .set(key, value.to_vec(), ttl);
        self.execute(txn).await
    }

    async fn remove(&self, key: &str) -> Result<bool, TransportError> {
        let mut entries = self.lock()?;
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize, TransportError> {
        let mut entries = self.lock()?;
        let mut removed = 0;
        for key in keys {
            if live(&mut entries, key).is_some() {
                entries.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let mut entries = self.lock()?;
        apply(
            &mut entries,
            TransactionOp::HashSet {
                key: key.to_string(),
                field: field.to_string(),
                value: value.to_vec(),
                ttl,
            },
        )
    }

    async fn hash_remove_field(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        let mut entries = self.lock()?;
        let existed = live(&mut entries, key)
            .map(|e| e.fields.contains_key(field))
            .unwrap_or(false);
        apply(
            &mut entries,
            TransactionOp::HashRemove {
                key: key.to_string(),
                field: field.to_string(),
            },
        )?;
        Ok(existed)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, TransportError> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key)
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }

    async fn hash_field_exists(&self, key: &str, field: &str) -> Result<bool, TransportError> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key)
            .map(|e| e.fields.contains_key(field))
            .unwrap_or(false))
    }

    async fn hash_length(&self, key: &str) -> Result<usize, TransportError> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key).map(|e| e.fields.len()).unwrap_or(0))
    }

    async fn hash_increment_field(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, TransportError> {
        let mut entries = self.lock()?;
        increment(&mut entries, key, field, delta)
    }

    async fn execute(&self, transaction: Transaction) -> Result<bool, TransportError> {
        let mut entries = self.lock()?;
        for precondition in transaction.preconditions() {
            if !check(&mut entries, precondition) {
                return Ok(false);
            }
        }

        // Apply on a scratch copy of the touched keys so a failing op leaves
        // the store as it was.
        let mut scratch: Entries = HashMap::new();
        let touched = touched_keys(&transaction);
        for key in &touched {
            if let Some(entry) = live(&mut entries, key) {
                scratch.insert(key.clone(), entry.clone());
            }
        }
        for op in transaction.operations().iter().cloned() {
            apply(&mut scratch, op)?;
        }
        for key in touched {
            match scratch.remove(&key) {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(true)
    }

    fn key_length_limit(&self) -> usize {
        self.key_length_limit
    }
}

fn touched_keys(transaction: &Transaction) -> Vec<String> {
    let mut keys: Vec<String> = transaction
        .operations()
        .iter()
        .map(|op| match op {
            TransactionOp::Set { key, .. }
            | TransactionOp::Remove { key }
            | TransactionOp::HashSet { key, .. }
            | TransactionOp::HashRemove { key, .. }
            | TransactionOp::HashIncrement { key, .. }
            | TransactionOp::Expire { key, .. } => key.clone(),
        })
        .collect();
    if transaction
        .operations()
        .iter()
        .any(|op| matches!(op, TransactionOp::Set { .. }))
    {
        keys.push(SEQUENCE_KEY.to_string());
    }
    keys.sort();
    keys.dedup();
    keys
}
