use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use super::{GeocodeError, GeocodeMatch, Geocoder, LookupResult};
use crate::config::GeocoderConfig;

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    addresstype: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl NominatimPlace {
    fn into_match(self) -> LookupResult<GeocodeMatch> {
        let parse = |field: &str, value: &str| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|e| GeocodeError::InvalidResponse(format!("{field} {value:?}: {e}")))
        };

        Ok(GeocodeMatch {
            latitude: parse("lat", &self.lat)?,
            longitude: parse("lon", &self.lon)?,
            place_type: self
                .addresstype
                .or(self.kind)
                .unwrap_or_else(|| "unknown".into()),
            label: self.display_name,
        })
    }
}

/// Geocoding boundary backed by a Nominatim-compatible search API.
///
/// Requests are spaced at least `min_interval` apart across all callers.
/// Each attempt is bounded by `request_timeout`. Transport errors, attempt
/// timeouts, 429 and 5xx responses are retried with exponential backoff
/// plus jitter; other statuses fail immediately.
pub struct NominatimGeocoder {
    client: Client,
    base_url: Url,
    country_codes: Option<String>,
    min_interval: Duration,
    max_retries: u32,
    retry_base: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl NominatimGeocoder {
    pub fn from_config(config: &GeocoderConfig) -> LookupResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .build()?;

        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            country_codes: config.country_codes.clone(),
            min_interval: config.min_interval(),
            max_retries: config.max_retries,
            retry_base: config.retry_base(),
            last_request: Mutex::new(None),
        })
    }

    fn search_url(&self, query: &str) -> LookupResult<Url> {
        let mut url = self.base_url.join("search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", query)
                .append_pair("format", "jsonv2")
                .append_pair("limit", "1");
            if let Some(codes) = &self.country_codes {
                pairs.append_pair("countrycodes", codes);
            }
        }
        Ok(url)
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let half = u64::try_from(self.retry_base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter_ms = rand::rng().random_range(0..=half);
        backoff_delay(self.retry_base, attempt, jitter_ms)
    }

    async fn search(&self, url: &Url) -> LookupResult<Vec<NominatimPlace>> {
        let mut attempt = 0;
        loop {
            self.throttle().await;

            let retryable = match self.client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Vec<NominatimPlace>>()
                        .await
                        .map_err(|e| GeocodeError::InvalidResponse(e.to_string()));
                }
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    GeocodeError::RateLimited
                }
                Ok(resp) if resp.status().is_server_error() => {
                    GeocodeError::Status(resp.status().as_u16())
                }
                Ok(resp) => return Err(GeocodeError::Status(resp.status().as_u16())),
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    GeocodeError::Http(e)
                }
                Err(e) => return Err(GeocodeError::Http(e)),
            };

            if attempt >= self.max_retries {
                return Err(retryable);
            }

            let delay = self.backoff(attempt);
            tracing::debug!(
                "Geocode request failed ({}); retry {} of {} in {:?}",
                retryable,
                attempt + 1,
                self.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32, jitter_ms: u64) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor)
        .saturating_add(Duration::from_millis(jitter_ms))
}

#[async_trait::async_trait]
impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, query: &str) -> LookupResult<Option<GeocodeMatch>> {
        let url = self.search_url(query)?;
        let places = self.search(&url).await?;
        places.into_iter().next().map(NominatimPlace::into_match).transpose()
    }

    async fn health_check(&self) -> LookupResult<()> {
        let mut url = self.base_url.join("status")?;
        url.query_pairs_mut().append_pair("format", "json");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GeocodeError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(GeocodeError::Unavailable(format!("status {}", resp.status())))
        }
    }
}
