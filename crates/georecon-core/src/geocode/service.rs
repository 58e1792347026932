use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{ConfidencePolicy, GeocodeResult, Geocoder, MatchQuality};
use crate::config::ReconConfig;
use crate::error::{Error, Result};

type Slot = Arc<Mutex<Option<GeocodeResult>>>;

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicUsize,
    service_calls: AtomicUsize,
    cache_hits: AtomicUsize,
    exact: AtomicUsize,
    approximate: AtomicUsize,
    unresolved: AtomicUsize,
    failures: AtomicUsize,
    timeouts: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodeStats {
    pub requests: usize,
    pub service_calls: usize,
    pub cache_hits: usize,
    pub exact: usize,
    pub approximate: usize,
    pub unresolved: usize,
    pub failures: usize,
    pub timeouts: usize,
}

impl GeocodeStats {
    /// Counters accumulated since `earlier` was taken.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            requests: self.requests.saturating_sub(earlier.requests),
            service_calls: self.service_calls.saturating_sub(earlier.service_calls),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            exact: self.exact.saturating_sub(earlier.exact),
            approximate: self.approximate.saturating_sub(earlier.approximate),
            unresolved: self.unresolved.saturating_sub(earlier.unresolved),
            failures: self.failures.saturating_sub(earlier.failures),
            timeouts: self.timeouts.saturating_sub(earlier.timeouts),
        }
    }
}

/// Applies the confidence policy on top of a [`Geocoder`].
///
/// Distinct queries run in parallel up to `max_concurrent`. Calls for the
/// same query are serialized behind a per-query slot and the first
/// definitive outcome (a match or a confirmed no-match) is reused. Errors
/// and timeouts degrade to [`MatchQuality::Unresolved`] and are retried on
/// the next request for that query.
pub struct GeocodingService {
    geocoder: Arc<dyn Geocoder>,
    policy: ConfidencePolicy,
    limiter: Arc<Semaphore>,
    slots: Mutex<HashMap<String, Slot>>,
    timeout: Duration,
    query_suffix: Option<String>,
    counters: Counters,
}

impl GeocodingService {
    #[must_use]
    pub fn new(geocoder: Arc<dyn Geocoder>, policy: ConfidencePolicy) -> Self {
        let defaults = crate::config::GeocoderConfig::default();
        Self {
            geocoder,
            policy,
            limiter: Arc::new(Semaphore::new(defaults.max_concurrent)),
            slots: Mutex::new(HashMap::new()),
            timeout: defaults.timeout(),
            query_suffix: None,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn from_config(geocoder: Arc<dyn Geocoder>, config: &ReconConfig) -> Self {
        let policy = ConfidencePolicy::from_config(&config.geocoder, config.dedup.rounding_decimals);
        Self::new(geocoder, policy)
            .with_max_concurrent(config.geocoder.max_concurrent)
            .with_timeout(config.geocoder.timeout())
            .with_query_suffix(config.geocoder.query_suffix.clone())
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max_concurrent.max(1)));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_query_suffix(mut self, suffix: Option<String>) -> Self {
        self.query_suffix = suffix.filter(|s| !s.trim().is_empty());
        self
    }

    /// Fails when the boundary cannot be reached. Run before any document.
    pub async fn check_reachable(&self) -> Result<()> {
        self.geocoder
            .health_check()
            .await
            .map_err(|e| Error::GeocoderUnreachable(e.to_string()))
    }

    /// The exact string sent to the service for a display name.
    #[must_use]
    pub fn query_for(&self, display_name: &str) -> String {
        match &self.query_suffix {
            Some(suffix) => format!("{display_name}{suffix}"),
            None => display_name.to_string(),
        }
    }

    pub async fn geocode(&self, display_name: &str) -> GeocodeResult {
        let query = self.query_for(display_name);
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(query.clone()).or_default())
        };

        let mut cached = slot.lock().await;
        if let Some(result) = cached.as_ref() {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return result.clone();
        }

        let (result, definitive) = self.call(&query).await;
        self.tally(result.match_quality());
        if definitive {
            *cached = Some(result.clone());
        }
        result
    }

    /// The flag is false for failures and timeouts; those are not cached so
    /// a later request for the same query reaches the boundary again.
    async fn call(&self, query: &str) -> (GeocodeResult, bool) {
        let Ok(_permit) = self.limiter.acquire().await else {
            tracing::warn!("Geocoding limiter closed; leaving {} unresolved", query);
            return (GeocodeResult::unresolved(query), false);
        };

        self.counters.service_calls.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.timeout, self.geocoder.resolve(query)).await {
            Ok(Ok(matched)) => {
                if matched.is_none() {
                    tracing::debug!("No geocoding match for {}", query);
                }
                (self.policy.classify(query, matched.as_ref()), true)
            }
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Geocoding failed for {}: {}", query, e);
                (GeocodeResult::unresolved(query), false)
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Geocoding timed out for {} after {:?}", query, self.timeout);
                (GeocodeResult::unresolved(query), false)
            }
        }
    }

    fn tally(&self, quality: MatchQuality) {
        let counter = match quality {
            MatchQuality::Exact => &self.counters.exact,
            MatchQuality::Approximate => &self.counters.approximate,
            MatchQuality::Unresolved => &self.counters.unresolved,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Geocodes every distinct display name concurrently. Keyed by display
    /// name.
    pub async fn geocode_all(
        self: &Arc<Self>,
        display_names: impl IntoIterator<Item = String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, GeocodeResult>> {
        let names: BTreeSet<String> = display_names.into_iter().collect();
        let mut tasks = JoinSet::new();

        for name in names {
            let service = Arc::clone(self);
            tasks.spawn(async move {
                let result = service.geocode(&name).await;
                (name, result)
            });
        }

        let mut results = HashMap::new();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    Some(outcome) => {
                        let (name, result) = outcome?;
                        results.insert(name, result);
                    }
                    None => break,
                },
            }
        }

        Ok(results)
    }

    #[must_use]
    pub fn stats(&self) -> GeocodeStats {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        GeocodeStats {
            requests: load(&self.counters.requests),
            service_calls: load(&self.counters.service_calls),
            cache_hits: load(&self.counters.cache_hits),
            exact: load(&self.counters.exact),
            approximate: load(&self.counters.approximate),
            unresolved: load(&self.counters.unresolved),
            failures: load(&self.counters.failures),
            timeouts: load(&self.counters.timeouts),
        }
    }
}
