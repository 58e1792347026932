use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for `geocoder.retry_base_ms`.
pub const MAX_RETRY_BASE_MS: u64 = 60_000;

/// How far deduplication reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileScope {
    /// One canonical table per document
    Document,
    /// One canonical table for the whole run
    #[default]
    Corpus,
}

impl ReconcileScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Corpus => "corpus",
        }
    }
}

/// What happens when the noise filter rejects a key that several
/// independent extractors reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The filter decides; the disagreement is only recorded
    #[default]
    ExclusionWins,
    /// Keys matched by a token or pattern rule survive when two or more
    /// sources report them. Whole-term vocabulary and stop-term matches
    /// are still excluded.
    KeepIfMultiSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub scope: ReconcileScope,
    pub noise: NoiseConfig,
    pub dedup: DedupConfig,
    pub geocoder: GeocoderConfig,
}

/// Exclusion vocabulary for the noise filter. Terms are compared on their
/// normalized form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Rock types, structural and geological terms, unit names
    pub excluded_terms: Vec<String>,
    /// Known non-place words that extractors tend to emit
    pub stop_terms: Vec<String>,
    /// Known places; a hit here plus an exclusion hit is an ambiguous case
    pub geographic_terms: Vec<String>,
    /// Regular expressions matched against the normalized key
    pub excluded_patterns: Vec<String>,
    /// Also exclude keys whose last word is an excluded term ("dori granite")
    pub match_tokens: bool,
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Decimal places kept in `rounded_latlon`
    pub rounding_decimals: u32,
    /// Jaro-Winkler floor two names must meet to merge on coordinates.
    /// `None` merges any two locations sharing a rounded coordinate.
    pub min_name_similarity: Option<f64>,
    /// Unmerged key pairs at or above this similarity are reported for review
    pub near_duplicate_threshold: Option<f64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            rounding_decimals: 2,
            min_name_similarity: None,
            near_duplicate_threshold: Some(0.92),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Minimum spacing between requests sent to the service
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    /// Ceiling on a single HTTP attempt; must stay below `timeout_ms` so
    /// retries fit inside one call
    pub request_timeout_ms: u64,
    /// Per-call ceiling across all attempts; a call that exceeds it
    /// resolves as unresolved
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    /// Appended to every query, e.g. ", Burkina Faso"
    pub query_suffix: Option<String>,
    /// ISO 3166-1 alpha-2 codes restricting the search
    pub country_codes: Option<String>,
    /// Place types classified as exact matches
    pub exact_place_types: Vec<String>,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".into(),
            user_agent: concat!("georecon/", env!("CARGO_PKG_VERSION")).into(),
            min_interval_ms: 1000,
            max_retries: 3,
            retry_base_ms: 500,
            request_timeout_ms: 5_000,
            timeout_ms: 30_000,
            max_concurrent: 4,
            query_suffix: None,
            country_codes: None,
            exact_place_types: default_exact_place_types(),
        }
    }
}

fn default_exact_place_types() -> Vec<String> {
    [
        "city",
        "town",
        "village",
        "hamlet",
        "isolated_dwelling",
        "locality",
        "suburb",
        "quarter",
        "neighbourhood",
        "farm",
        "peak",
        "hill",
        "mine",
        "quarry",
        "spring",
        "water_point",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl GeocoderConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    #[must_use]
    pub fn exact_place_type_set(&self) -> BTreeSet<String> {
        self.exact_place_types
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl ReconConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// `<config dir>/georecon/config.toml`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("georecon").join("config.toml"))
    }

    /// Checks everything that must hold before any document is processed.
    pub fn validate(&self) -> Result<()> {
        if self
            .noise
            .excluded_terms
            .iter()
            .all(|t| crate::normalize::is_blank(t))
        {
            return Err(Error::MissingVocabulary);
        }

        for pattern in &self.noise.excluded_patterns {
            regex::Regex::new(pattern)?;
        }

        if self.dedup.rounding_decimals > 7 {
            return Err(Error::InvalidPrecision(self.dedup.rounding_decimals));
        }

        for (name, value) in [
            ("dedup.min_name_similarity", self.dedup.min_name_similarity),
            ("dedup.near_duplicate_threshold", self.dedup.near_duplicate_threshold),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(Error::Config(format!("{name} must be within [0, 1], got {v}")));
                }
            }
        }

        if self.geocoder.max_concurrent == 0 {
            return Err(Error::Config("geocoder.max_concurrent must be at least 1".into()));
        }

        if self.geocoder.timeout_ms == 0 {
            return Err(Error::Config("geocoder.timeout_ms must be positive".into()));
        }

        if self.geocoder.request_timeout_ms == 0 {
            return Err(Error::Config("geocoder.request_timeout_ms must be positive".into()));
        }

        if self.geocoder.request_timeout_ms >= self.geocoder.timeout_ms {
            return Err(Error::Config(format!(
                "geocoder.request_timeout_ms ({}) must be below geocoder.timeout_ms ({})",
                self.geocoder.request_timeout_ms, self.geocoder.timeout_ms
            )));
        }

        if self.geocoder.retry_base_ms > MAX_RETRY_BASE_MS {
            return Err(Error::Config(format!(
                "geocoder.retry_base_ms must be at most {MAX_RETRY_BASE_MS}, got {}",
                self.geocoder.retry_base_ms
            )));
        }

        url::Url::parse(&self.geocoder.base_url)
            .map_err(|e| Error::Config(format!("geocoder.base_url: {e}")))?;

        Ok(())
    }
}
