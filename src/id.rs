//! Deterministic hashed identifiers with adaptive suffix length.
//!
//! IDs look like `el-4f2a` / `en-9c01`: a kind prefix plus a lowercase hex
//! suffix derived from the `{identifier, createdBy}` tuple. The suffix length
//! adapts to the element count so short ids stay short while collision
//! probability stays low.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoneforgeError};

/// Hard bounds on the hex suffix.
pub const MIN_SUFFIX_LEN: usize = 3;
pub const MAX_SUFFIX_LEN: usize = 8;

/// (exclusive upper element count, minimum suffix length) tiers.
const LENGTH_TIERS: [(u64, usize); 4] = [(100, 4), (2_500, 5), (15_000, 6), (80_000, 7)];

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(el|en)-([0-9a-f]{3,8})$").expect("id pattern"));

/// Minimum suffix length for a given element count.
#[must_use]
pub fn length_for_count(count: u64) -> usize {
    for (limit, len) in LENGTH_TIERS {
        if count < limit {
            return len;
        }
    }
    MAX_SUFFIX_LEN
}

/// Hex suffix for an `{identifier, createdBy}` tuple. The attempt counter
/// is bumped by the mint loop on collision.
#[must_use]
pub fn suffix_for(identifier: &str, created_by: &str, attempt: u32, len: usize) -> String {
    let len = len.clamp(MIN_SUFFIX_LEN, MAX_SUFFIX_LEN);
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hasher.update(b"\n");
    hasher.update(created_by.as_bytes());
    hasher.update(b"\n");
    hasher.update(attempt.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..len].to_string()
}

/// Parse `<prefix>-<suffix>`; permissive about suffix length within bounds.
///
/// # Errors
///
/// Returns a validation error for anything outside the id shape.
pub fn parse_id(id: &str) -> Result<(String, String)> {
    ID_PATTERN.captures(id).map_or_else(
        || Err(StoneforgeError::validation(format!("malformed id: {id}"))),
        |caps| Ok((caps[1].to_string(), caps[2].to_string())),
    )
}

/// Mint a fresh id, retrying with a bumped attempt counter on collision and
/// growing the suffix toward the maximum when collisions persist.
///
/// # Errors
///
/// Propagates probe errors; returns a conflict error if the space is
/// exhausted even at maximum length.
pub fn mint_id<F>(
    prefix: &str,
    identifier: &str,
    created_by: &str,
    base_len: usize,
    mut exists: F,
) -> Result<String>
where
    F: FnMut(&str) -> Result<bool>,
{
    let mut len = base_len.clamp(MIN_SUFFIX_LEN, MAX_SUFFIX_LEN);
    let mut attempt: u32 = 0;
    loop {
        let candidate = format!("{prefix}-{}", suffix_for(identifier, created_by, attempt, len));
        if !exists(&candidate)? {
            return Ok(candidate);
        }
        attempt += 1;
        // Every few collisions, widen the suffix.
        if attempt % 4 == 0 && len < MAX_SUFFIX_LEN {
            len += 1;
        }
        if attempt > 64 {
            return Err(StoneforgeError::conflict(format!(
                "unable to mint unique id for {identifier}"
            )));
        }
    }
}

/// Tuning for the length cache.
#[derive(Debug, Clone, Copy)]
pub struct IdServiceConfig {
    /// How long a cached count stays fresh.
    pub ttl: Duration,
    /// Creates between forced growth checks.
    pub growth_threshold: u64,
}

impl Default for IdServiceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            growth_threshold: 100,
        }
    }
}

/// Cache observability snapshot.
#[derive(Debug, Clone, Copy)]
pub struct IdStats {
    pub element_count: u64,
    pub suffix_length: usize,
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub creates_since_refresh: u64,
    pub age: Option<Duration>,
    pub stale: bool,
}

impl IdStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Element-count-driven suffix length cache. Process-local, one per store
/// handle; the owning workspace supplies fresh counts from the backend.
#[derive(Debug)]
pub struct IdService {
    config: IdServiceConfig,
    element_count: u64,
    suffix_length: usize,
    refreshed_at: Option<Instant>,
    creates_since_refresh: u64,
    hits: u64,
    misses: u64,
    refreshes: u64,
}

impl IdService {
    #[must_use]
    pub fn new(config: IdServiceConfig) -> Self {
        Self {
            config,
            element_count: 0,
            suffix_length: length_for_count(0),
            refreshed_at: None,
            creates_since_refresh: 0,
            hits: 0,
            misses: 0,
            refreshes: 0,
        }
    }

    /// Whether the cached count is past its TTL (or never loaded).
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.refreshed_at
            .is_none_or(|at| at.elapsed() >= self.config.ttl)
    }

    /// Cached suffix length. Pass a fresh count when [`Self::needs_refresh`]
    /// said so; that call counts as a miss, otherwise as a hit.
    pub fn hash_length(&mut self, fresh_count: Option<u64>) -> usize {
        if let Some(count) = fresh_count {
            self.misses += 1;
            self.apply_refresh(count);
        } else {
            self.hits += 1;
        }
        self.suffix_length
    }

    /// Count one element creation. Returns true when the caller should fetch
    /// a fresh count and call [`Self::apply_refresh`]: the growth threshold
    /// was crossed and the projected count would bump the suffix length.
    pub fn notify_create(&mut self) -> bool {
        self.creates_since_refresh += 1;
        self.creates_since_refresh >= self.config.growth_threshold
            && length_for_count(self.element_count + self.creates_since_refresh)
                > self.suffix_length
    }

    /// Install a fresh element count.
    pub fn apply_refresh(&mut self, count: u64) {
        self.element_count = count;
        self.suffix_length = length_for_count(count);
        self.refreshed_at = Some(Instant::now());
        self.creates_since_refresh = 0;
        self.refreshes += 1;
    }

    #[must_use]
    pub fn suffix_length(&self) -> usize {
        self.suffix_length
    }

    #[must_use]
    pub fn stats(&self) -> IdStats {
        IdStats {
            element_count: self.element_count,
            suffix_length: self.suffix_length,
            hits: self.hits,
            misses: self.misses,
            refreshes: self.refreshes,
            creates_since_refresh: self.creates_since_refresh,
            age: self.refreshed_at.map(|at| at.elapsed()),
            stale: self.needs_refresh(),
        }
    }
}

impl Default for IdService {
    fn default() -> Self {
        Self::new(IdServiceConfig::default())
    }
}
