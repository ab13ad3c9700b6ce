//! ETA oracle client.
//!
//! Wraps the backend's pairwise travel-time query. The oracle answers with a
//! Korean duration phrase ("3분 15초"), which [`parse_duration_message`]
//! reduces to whole seconds. On top of the remote call the client adds:
//!
//! - a zero-distance short-circuit (no remote call when origin and
//!   destination are within [`SAME_PLACE_EPSILON`] degrees),
//! - a fixed [`QUOTA_FALLBACK_SECONDS`] answer when the oracle reports its
//!   quota exhausted,
//! - a name-keyed cache holding the latest answer per name. A write always
//!   replaces the previous entry; a fresh entry for the same origin is served
//!   without a remote call.
//!
//! Any other failure yields `None` and callers leave that pair out of the
//! current cycle. There is no retry; the next refresh cycle asks again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;

use crate::error::{Result, TrackerError};
use crate::models::{ApiEnvelope, Coordinate, EtaReply, NamedCoordinate};

/// Seconds reported when the oracle's quota is exhausted.
pub const QUOTA_FALLBACK_SECONDS: u32 = 300;

/// Per-axis distance, in degrees, under which two points count as the same place.
pub const SAME_PLACE_EPSILON: f64 = 1e-4;

static DURATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)분\s*(\d+)?초?").expect("duration pattern is valid"));

/// Parse "`<m>`분 `<s>`초" or "`<m>`분" into seconds.
///
/// Missing seconds count as 0 and a phrase without a minutes part parses to 0.
pub fn parse_duration_message(message: &str) -> u32 {
    let Some(captures) = DURATION_PATTERN.captures(message) else {
        return 0;
    };

    let minutes = captures
        .get(1)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let seconds = captures
        .get(2)
        .and_then(|s| s.as_str().parse::<u64>().ok())
        .unwrap_or(0);

    u32::try_from(minutes.saturating_mul(60).saturating_add(seconds)).unwrap_or(u32::MAX)
}

/// Format seconds as "`<m>`분 `<s>`초".
pub fn format_duration(seconds: u32) -> String {
    format!("{}분 {}초", seconds / 60, seconds % 60)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtaEstimate {
    pub name: String,
    pub duration_seconds: u32,
    /// Served from an earlier answer rather than a remote call.
    pub from_cache: bool,
}

/// Remote pairwise travel-time query.
pub trait EtaOracle: Send + Sync {
    fn query(
        &self,
        origin: &NamedCoordinate,
        destination: &NamedCoordinate,
    ) -> impl Future<Output = Result<EtaReply>> + Send;
}

#[derive(Clone)]
pub struct HttpEtaOracle {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEtaOracle {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token,
        }
    }
}

impl EtaOracle for HttpEtaOracle {
    async fn query(&self, origin: &NamedCoordinate, destination: &NamedCoordinate) -> Result<EtaReply> {
        let url = format!("{}/kakao-api/arrival-time/single", self.base_url);

        let mut request = self.http.get(&url).query(&[
            ("origin", origin.to_query()),
            ("destination", destination.to_query()),
        ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TrackerError::OracleUnavailable(e.to_string()))?;

        // The oracle signals an exhausted quota with 400.
        if response.status() == StatusCode::BAD_REQUEST {
            return Err(TrackerError::OracleQuotaExceeded);
        }

        if !response.status().is_success() {
            return Err(TrackerError::OracleUnavailable(format!(
                "oracle returned {}",
                response.status()
            )));
        }

        let envelope: ApiEnvelope<EtaReply> = response
            .json()
            .await
            .map_err(|e| TrackerError::Parse(format!("Invalid ETA response: {}", e)))?;

        Ok(envelope.data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EtaEntry {
    pub remaining_seconds: u32,
    pub last_updated: DateTime<Utc>,
    /// Origin the answer was computed from.
    pub origin: Coordinate,
}

impl EtaEntry {
    /// Remaining time as of `now`: the recorded answer minus its age.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u32 {
        let age = now
            .signed_duration_since(self.last_updated)
            .num_seconds()
            .clamp(0, i64::from(u32::MAX));
        self.remaining_seconds.saturating_sub(age as u32)
    }
}

/// Latest ETA per name.
#[derive(Debug, Default)]
pub struct EtaCache {
    entries: HashMap<String, EtaEntry>,
}

impl EtaCache {
    pub fn record(&mut self, name: &str, entry: EtaEntry) {
        self.entries.insert(name.to_string(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&EtaEntry> {
        self.entries.get(name)
    }

    /// Entry computed from (nearly) the same origin no longer ago than `ttl`.
    pub fn fresh(
        &self,
        name: &str,
        origin: &Coordinate,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<&EtaEntry> {
        let entry = self.get(name)?;
        let age = now.signed_duration_since(entry.last_updated).to_std().ok()?;
        (age <= ttl && entry.origin.near(origin, SAME_PLACE_EPSILON)).then_some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Which side of the pair names the cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
    /// One vehicle, many stops (route tracking).
    Destination,
    /// Many vehicles, one stop (arrival board).
    Origin,
}

pub struct EtaClient<O> {
    oracle: O,
    cache: Mutex<EtaCache>,
    key: CacheKey,
    ttl: Duration,
}

impl<O: EtaOracle> EtaClient<O> {
    pub fn new(oracle: O, key: CacheKey, ttl: Duration) -> Self {
        Self {
            oracle,
            cache: Mutex::new(EtaCache::default()),
            key,
            ttl,
        }
    }

    /// Travel time from `origin` to `destination`, or `None` if unavailable.
    pub async fn eta(
        &self,
        origin: &NamedCoordinate,
        destination: &NamedCoordinate,
    ) -> Option<EtaEstimate> {
        let name = match self.key {
            CacheKey::Destination => destination.name.clone(),
            CacheKey::Origin => origin.name.clone(),
        };
        let now = Utc::now();

        if origin.coordinate.near(&destination.coordinate, SAME_PLACE_EPSILON) {
            self.store(&name, 0, origin.coordinate, now);
            return Some(EtaEstimate {
                name,
                duration_seconds: 0,
                from_cache: false,
            });
        }

        let cached = self
            .cache()
            .fresh(&name, &origin.coordinate, self.ttl, now)
            .map(|entry| entry.remaining_at(now));
        if let Some(seconds) = cached {
            return Some(EtaEstimate {
                name,
                duration_seconds: seconds,
                from_cache: true,
            });
        }

        match self.oracle.query(origin, destination).await {
            Ok(reply) => {
                let seconds = parse_duration_message(&reply.duration_message);
                tracing::trace!(
                    stop = %name,
                    reply = %reply.name,
                    message = %reply.duration_message,
                    seconds,
                    "ETA resolved"
                );
                self.store(&name, seconds, origin.coordinate, Utc::now());
                Some(EtaEstimate {
                    name,
                    duration_seconds: seconds,
                    from_cache: false,
                })
            }
            Err(TrackerError::OracleQuotaExceeded) => {
                tracing::warn!(
                    stop = %name,
                    fallback_secs = QUOTA_FALLBACK_SECONDS,
                    "ETA quota exceeded, using fallback"
                );
                Some(EtaEstimate {
                    name,
                    duration_seconds: QUOTA_FALLBACK_SECONDS,
                    from_cache: false,
                })
            }
            Err(e) => {
                tracing::debug!(stop = %name, error = %e, "ETA unavailable");
                None
            }
        }
    }

    /// Latest recorded answer for a name.
    #[cfg(test)]
    pub fn latest(&self, name: &str) -> Option<EtaEntry> {
        self.cache().get(name).cloned()
    }

    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }

    /// Forget every recorded answer, e.g. when the fixed side of the pair changes.
    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    fn store(&self, name: &str, seconds: u32, origin: Coordinate, now: DateTime<Utc>) {
        self.cache().record(
            name,
            EtaEntry {
                remaining_seconds: seconds,
                last_updated: now,
                origin,
            },
        );
    }

    fn cache(&self) -> MutexGuard<'_, EtaCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
