use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{GeocodeError, GeocodeMatch, Geocoder, LookupResult};
use crate::normalize::normalize;

/// In-memory geocoder keyed by normalized query. Used for offline re-runs
/// against a previously captured gazetteer, and in tests.
#[derive(Debug, Default)]
pub struct StaticGeocoder {
    places: HashMap<String, GeocodeMatch>,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl StaticGeocoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_place(mut self, query: &str, matched: GeocodeMatch) -> Self {
        self.places.insert(normalize(query), matched);
        self
    }

    /// Queries that fail as if the service had given up after retries.
    #[must_use]
    pub fn with_failure(mut self, query: &str) -> Self {
        self.failing.insert(normalize(query));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Geocoder for StaticGeocoder {
    async fn resolve(&self, query: &str) -> LookupResult<Option<GeocodeMatch>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let key = normalize(query);
        if self.failing.contains(&key) {
            return Err(GeocodeError::Unavailable(format!("lookup failed for {query}")));
        }
        Ok(self.places.get(&key).cloned())
    }
}
