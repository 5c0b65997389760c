//! Fixed-window admission control keyed by client and endpoint category.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    Extraction,
    Conversion,
    Proxy,
    Download,
    Results,
}

impl EndpointCategory {
    pub const ALL: [EndpointCategory; 5] = [
        Self::Extraction,
        Self::Conversion,
        Self::Proxy,
        Self::Download,
        Self::Results,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Conversion => "conversion",
            Self::Proxy => "proxy",
            Self::Download => "download",
            Self::Results => "results",
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown endpoint category '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs.max(1)),
        }
    }

    pub fn default_for(category: EndpointCategory) -> Self {
        match category {
            EndpointCategory::Extraction => Self::new(10, 60),
            EndpointCategory::Conversion => Self::new(5, 60),
            EndpointCategory::Proxy => Self::new(30, 60),
            EndpointCategory::Download => Self::new(20, 60),
            EndpointCategory::Results => Self::new(60, 60),
        }
    }
}

/// Counter key: one budget per client per category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub client: String,
    pub category: EndpointCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub count: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("Rate-limit store unavailable: {0}")]
pub struct CounterStoreError(pub String);

/// Storage for rate-limit counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Removes every counter whose window ended at or before `now`.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<(), CounterStoreError>;

    async fn get(&self, key: &CounterKey) -> Result<Option<RateLimitCounter>, CounterStoreError>;

    /// Counts one request against `key` if it is under `max_requests`.
    ///
    /// Opening a fresh window, the ceiling check and the increment happen as
    /// one step, so concurrent callers never admit more than the ceiling.
    async fn try_acquire(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
        window: Duration,
        max_requests: u32,
    ) -> Result<Acquisition, CounterStoreError>;
}

/// Result of [`CounterStore::try_acquire`]: the counter after the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    pub counter: RateLimitCounter,
    pub admitted: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<CounterKey, RateLimitCounter>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<(), CounterStoreError> {
        self.counters.retain(|_, c| c.expires_at > now);
        Ok(())
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<RateLimitCounter>, CounterStoreError> {
        Ok(self.counters.get(key).map(|c| *c))
    }

    async fn try_acquire(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
        window: Duration,
        max_requests: u32,
    ) -> Result<Acquisition, CounterStoreError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| CounterStoreError(e.to_string()))?;
        // the entry guard holds the shard lock for the whole update
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert(RateLimitCounter {
                count: 0,
                expires_at: now + window,
            });
        if entry.expires_at <= now {
            *entry = RateLimitCounter {
                count: 0,
                expires_at: now + window,
            };
        }
        let admitted = entry.count < max_requests;
        if admitted {
            entry.count += 1;
        }
        Ok(Acquisition {
            counter: *entry,
            admitted,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    Rejected {
        limit: u32,
        retry_after_secs: u64,
        reset_at: DateTime<Utc>,
    },
    /// The counter store failed; the request is let through untracked.
    Unmetered,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// A client's current standing in one category, without consuming budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub category: EndpointCategory,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct AdmissionControl {
    store: Arc<dyn CounterStore>,
    policies: Arc<DashMap<EndpointCategory, RateLimitPolicy>>,
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()))
    }
}

impl AdmissionControl {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        let policies = DashMap::new();
        for category in EndpointCategory::ALL {
            policies.insert(category, RateLimitPolicy::default_for(category));
        }
        Self {
            store,
            policies: Arc::new(policies),
        }
    }

    pub fn with_policy(self, category: EndpointCategory, policy: RateLimitPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    pub fn policy(&self, category: EndpointCategory) -> RateLimitPolicy {
        self.policies
            .get(&category)
            .map(|p| *p)
            .unwrap_or_else(|| RateLimitPolicy::default_for(category))
    }

    pub async fn check(&self, client: &str, category: EndpointCategory) -> Admission {
        self.check_at(client, category, Utc::now()).await
    }

    /// Counts one request. Fails open when the store errors.
    pub async fn check_at(
        &self,
        client: &str,
        category: EndpointCategory,
        now: DateTime<Utc>,
    ) -> Admission {
        match self.try_check(client, category, now).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(client, %category, error = %e, "Rate-limit store failed, allowing request");
                Admission::Unmetered
            }
        }
    }

    async fn try_check(
        &self,
        client: &str,
        category: EndpointCategory,
        now: DateTime<Utc>,
    ) -> Result<Admission, CounterStoreError> {
        let policy = self.policy(category);
        let key = CounterKey {
            client: client.to_string(),
            category,
        };

        self.store.prune_expired(now).await?;
        let Acquisition { counter, admitted } = self
            .store
            .try_acquire(&key, now, policy.window, policy.max_requests)
            .await?;

        if !admitted {
            let retry_after_secs = seconds_until(counter.expires_at, now);
            debug!(client, %category, retry_after_secs, "Request rejected by rate limit");
            return Ok(Admission::Rejected {
                limit: policy.max_requests,
                retry_after_secs,
                reset_at: counter.expires_at,
            });
        }

        Ok(Admission::Allowed {
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(counter.count),
            reset_at: counter.expires_at,
        })
    }

    /// Reports the remaining budget in every category.
    pub async fn budgets(&self, client: &str, now: DateTime<Utc>) -> Vec<Budget> {
        let mut out = Vec::with_capacity(EndpointCategory::ALL.len());
        for category in EndpointCategory::ALL {
            let policy = self.policy(category);
            let key = CounterKey {
                client: client.to_string(),
                category,
            };
            let live = match self.store.get(&key).await {
                Ok(c) => c.filter(|c| c.expires_at > now),
                Err(e) => {
                    warn!(client, %category, error = %e, "Rate-limit store failed during budget lookup");
                    None
                }
            };
            out.push(Budget {
                category,
                limit: policy.max_requests,
                remaining: policy
                    .max_requests
                    .saturating_sub(live.map(|c| c.count).unwrap_or(0)),
                reset_at: live.map(|c| c.expires_at),
            });
        }
        out
    }
}

/// Whole seconds until `at`, rounded up, at least 1.
fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (at - now).num_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}
