//! Caching module for Hybrid-BLAST
//!
//! Content-addressed store of raw BLAST reports. Entries are keyed by a
//! [`Fingerprint`] of everything that influences the result, kept in an
//! in-memory layer and persisted as one JSON file per fingerprint.

mod flight;

pub use flight::{FlightFollower, FlightLeader, FlightResult, Reservation};

use crate::backends::RawResult;
use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::query::{SearchParameters, SequenceQuery};
use chrono::{DateTime, Utc};
use flight::FlightTable;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bumped whenever the canonical encoding below changes
const FINGERPRINT_VERSION: &[u8] = b"hybrid-blast/fingerprint/v1";

const ENTRY_EXTENSION: &str = "json";

/// Deterministic digest of (sequence, program, database, parameters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a query searched with the given (effective) parameters
    pub fn of(query: &SequenceQuery, params: &SearchParameters) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION);
        for field in [
            query.sequence(),
            query.program.as_str(),
            query.database.as_str(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(encode_parameters(params));

        Self(format!("{:x}", hasher.finalize()))
    }

    #[cfg(test)]
    pub(crate) fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical, order-fixed byte encoding of the parameter set
fn encode_parameters(params: &SearchParameters) -> Vec<u8> {
    fn opt<T: fmt::Display>(value: &Option<T>) -> String {
        value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
    }

    format!(
        "word_size={};evalue={:016x};reward={};penalty={};hitlist={};max_hsps={};megablast={};filter={};matrix={}",
        opt(&params.word_size),
        params.evalue.to_bits(),
        opt(&params.reward),
        opt(&params.penalty),
        params.hitlist_size,
        opt(&params.max_hsps),
        params.megablast,
        opt(&params.filter),
        opt(&params.matrix),
    )
    .into_bytes()
}

/// One cached report. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub payload: RawResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, payload: RawResult, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| created_at + ttl);

        Self {
            fingerprint,
            payload,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// Counts reported by [`CacheStore::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub expired: usize,
    pub valid: usize,
    pub in_memory: u64,
    pub in_flight: usize,
}

/// Cache for raw search results with single-flight reservation
pub struct CacheStore {
    enabled: bool,
    memory: Cache<Fingerprint, CacheEntry>,
    directory: Option<PathBuf>,
    ttl: Option<Duration>,
    flights: Arc<FlightTable>,
    write_lock: tokio::sync::Mutex<()>,
}

impl CacheStore {
    /// Create a cache store from settings
    pub fn new(settings: &CacheSettings) -> Self {
        let ttl = settings.ttl_secs.map(Duration::from_secs);
        let mut store = Self::build(ttl, settings.memory_capacity, settings.directory.clone());
        store.enabled = settings.enabled;
        store
    }

    /// Memory-only store
    pub fn in_memory(ttl: Option<Duration>) -> Self {
        Self::build(ttl, 10_000, None)
    }

    /// File-backed store rooted at `directory`
    pub fn with_directory(directory: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self::build(ttl, 10_000, Some(directory.into()))
    }

    /// Store that never hits; single-flight still deduplicates concurrent work
    pub fn disabled() -> Self {
        let mut store = Self::build(None, 1, None);
        store.enabled = false;
        store
    }

    fn build(ttl: Option<Duration>, capacity: u64, directory: Option<PathBuf>) -> Self {
        let mut builder = Cache::builder().max_capacity(capacity);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            enabled: true,
            memory: builder.build(),
            directory,
            ttl,
            flights: Arc::new(FlightTable::default()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Get a live entry. Expired, corrupt and unreadable entries are misses.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }

        if let Some(entry) = self.memory.get(fingerprint).await {
            if !entry.is_expired(Utc::now()) {
                return Some(entry);
            }
            self.memory.invalidate(fingerprint).await;
        }

        let path = self.entry_path(fingerprint)?;
        match read_entry(&path, fingerprint).await {
            Ok(Some(entry)) if !entry.is_expired(Utc::now()) => {
                self.memory.insert(fingerprint.clone(), entry.clone()).await;
                Some(entry)
            }
            Ok(Some(_)) => {
                debug!(fingerprint = %fingerprint.short(), "cache entry expired");
                self.discard_stale(&path, fingerprint).await;
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "discarding unreadable cache entry");
                self.discard_stale(&path, fingerprint).await;
                None
            }
        }
    }

    /// Store a result, replacing any previous entry for the fingerprint.
    ///
    /// Persistence failures are logged; the in-memory layer is still updated.
    pub async fn store(&self, fingerprint: &Fingerprint, payload: RawResult) -> CacheEntry {
        let entry = CacheEntry::new(fingerprint.clone(), payload, self.ttl);
        if !self.enabled {
            return entry;
        }

        if let Some(path) = self.entry_path(fingerprint) {
            let _guard = self.write_lock.lock().await;
            if let Err(e) = write_entry(&path, &entry).await {
                warn!(fingerprint = %fingerprint.short(), error = %e, "failed to persist cache entry");
            }
        }

        self.memory.insert(fingerprint.clone(), entry.clone()).await;
        entry
    }

    /// Reserve the right to execute `fingerprint`; see [`Reservation`].
    pub fn reserve(&self, fingerprint: &Fingerprint) -> Reservation {
        self.flights.reserve(fingerprint)
    }

    /// Physically remove expired and corrupt entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        self.memory.run_pending_tasks().await;
        let now = Utc::now();
        let mut removed = 0;

        for (path, entry) in self.scan().await {
            let stale = match entry {
                Ok(entry) => entry.is_expired(now),
                Err(_) => true,
            };
            if stale {
                self.remove_file(&path).await;
                removed += 1;
            }
        }

        debug!(removed, "purged expired cache entries");
        removed
    }

    /// Remove every entry. Returns the number of files removed.
    pub async fn clear(&self) -> usize {
        self.memory.invalidate_all();
        let mut removed = 0;
        for (path, _) in self.scan().await {
            self.remove_file(&path).await;
            removed += 1;
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        self.memory.run_pending_tasks().await;
        let now = Utc::now();
        let mut stats = CacheStats {
            in_memory: self.memory.entry_count(),
            in_flight: self.flights.len(),
            ..Default::default()
        };

        for (_, entry) in self.scan().await {
            stats.total += 1;
            match entry {
                Ok(entry) if !entry.is_expired(now) => stats.valid += 1,
                _ => stats.expired += 1,
            }
        }

        stats
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", fingerprint.as_str(), ENTRY_EXTENSION)))
    }

    /// Remove `path` unless a concurrent store has replaced it with a live entry
    async fn discard_stale(&self, path: &Path, fingerprint: &Fingerprint) {
        let _guard = self.write_lock.lock().await;
        if let Ok(Some(entry)) = read_entry(path, fingerprint).await {
            if !entry.is_expired(Utc::now()) {
                debug!(fingerprint = %fingerprint.short(), "cache entry refreshed, keeping it");
                return;
            }
        }
        remove_path(path).await;
    }

    async fn remove_file(&self, path: &Path) {
        let _guard = self.write_lock.lock().await;
        remove_path(path).await;
    }

    /// All entry files with their parse result
    async fn scan(&self) -> Vec<(PathBuf, Result<CacheEntry, CacheError>)> {
        let Some(dir) = self.directory.as_ref() else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(_) => return entries,
        };

        while let Ok(Some(item)) = read_dir.next_entry().await {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes).map_err(CacheError::from),
                Err(e) => Err(CacheError::from(e)),
            };
            entries.push((path, parsed));
        }

        entries
    }
}

async fn remove_path(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

async fn read_entry(
    path: &Path,
    fingerprint: &Fingerprint,
) -> Result<Option<CacheEntry>, CacheError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let entry: CacheEntry = serde_json::from_slice(&bytes)?;
    if &entry.fingerprint != fingerprint {
        return Err(CacheError::FingerprintMismatch {
            expected: fingerprint.to_string(),
            found: entry.fingerprint.to_string(),
        });
    }

    Ok(Some(entry))
}

/// Write to a temporary sibling and rename over the target
async fn write_entry(path: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = serde_json::to_vec_pretty(entry)?;
    let tmp = path.with_extension(format!("{}.tmp-{}", ENTRY_EXTENSION, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    Ok(())
}
