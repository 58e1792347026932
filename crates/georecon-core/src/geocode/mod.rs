mod nominatim;
mod policy;
mod service;
mod table;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use nominatim::NominatimGeocoder;
pub use policy::ConfidencePolicy;
pub use service::{GeocodeStats, GeocodingService};
pub use table::StaticGeocoder;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Service returned status {0}")]
    Status(u16),
    #[error("Rate limited")]
    RateLimited,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

pub type LookupResult<T> = Result<T, GeocodeError>;

/// Coarse confidence tier. The only confidence signal handed to rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    Exact,
    Approximate,
    Unresolved,
}

impl MatchQuality {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Approximate => "approximate",
            Self::Unresolved => "unresolved",
        }
    }

    /// Higher is better.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Exact => 2,
            Self::Approximate => 1,
            Self::Unresolved => 0,
        }
    }
}

impl std::fmt::Display for MatchQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchQuality {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "approximate" => Ok(Self::Approximate),
            "unresolved" => Ok(Self::Unresolved),
            _ => Err(crate::Error::InvalidMatchQuality(s.to_string())),
        }
    }
}

/// A coordinate rounded to a fixed number of decimals, held as scaled
/// integers so equality and hashing are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundedLatLon {
    lat_scaled: i64,
    lon_scaled: i64,
    decimals: u32,
}

impl RoundedLatLon {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(latitude: f64, longitude: f64, decimals: u32) -> Self {
        let scale = 10f64.powi(decimals as i32);
        Self {
            lat_scaled: (latitude * scale).round() as i64,
            lon_scaled: (longitude * scale).round() as i64,
            decimals,
        }
    }

    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.lat_scaled as f64 / 10f64.powi(self.decimals as i32)
    }

    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.lon_scaled as f64 / 10f64.powi(self.decimals as i32)
    }

    #[must_use]
    pub fn decimals(&self) -> u32 {
        self.decimals
    }
}

impl std::fmt::Display for RoundedLatLon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.decimals as usize;
        write!(f, "{:.d$},{:.d$}", self.latitude(), self.longitude())
    }
}

/// What the geocoding boundary returns for a query that matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeMatch {
    pub latitude: f64,
    pub longitude: f64,
    pub place_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl GeocodeMatch {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, place_type: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            place_type: place_type.into(),
            label: None,
        }
    }

    #[must_use]
    pub fn is_plausible(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct Coordinates {
    latitude: f64,
    longitude: f64,
    rounded: RoundedLatLon,
}

/// Outcome of geocoding a canonical location.
///
/// Coordinates exist exactly when the quality is exact or approximate;
/// the constructors make a partial coordinate unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResult {
    geocode_query_str: String,
    match_quality: MatchQuality,
    #[serde(flatten)]
    coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    place_type: Option<String>,
}

impl GeocodeResult {
    #[must_use]
    pub fn unresolved(query: impl Into<String>) -> Self {
        Self {
            geocode_query_str: query.into(),
            match_quality: MatchQuality::Unresolved,
            coordinates: None,
            place_type: None,
        }
    }

    /// `quality` must be a resolved tier; anything else, or an implausible
    /// coordinate, yields an unresolved result.
    #[must_use]
    pub fn resolved(
        query: impl Into<String>,
        matched: &GeocodeMatch,
        quality: MatchQuality,
        decimals: u32,
    ) -> Self {
        if quality == MatchQuality::Unresolved || !matched.is_plausible() {
            return Self::unresolved(query);
        }
        Self {
            geocode_query_str: query.into(),
            match_quality: quality,
            coordinates: Some(Coordinates {
                latitude: matched.latitude,
                longitude: matched.longitude,
                rounded: RoundedLatLon::new(matched.latitude, matched.longitude, decimals),
            }),
            place_type: Some(matched.place_type.clone()),
        }
    }

    pub fn geocode_query_str(&self) -> &str {
        &self.geocode_query_str
    }

    pub fn match_quality(&self) -> MatchQuality {
        self.match_quality
    }

    pub fn latitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.longitude)
    }

    pub fn rounded_latlon(&self) -> Option<RoundedLatLon> {
        self.coordinates.map(|c| c.rounded)
    }

    pub fn place_type(&self) -> Option<&str> {
        self.place_type.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.coordinates.is_some()
    }
}

/// The external geocoding boundary. Implementations own their rate limiting
/// and retries; `Ok(None)` means the service found no match.
#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, query: &str) -> LookupResult<Option<GeocodeMatch>>;

    /// Called once before a run starts.
    async fn health_check(&self) -> LookupResult<()> {
        Ok(())
    }
}
