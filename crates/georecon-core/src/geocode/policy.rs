use std::collections::BTreeSet;

use super::{GeocodeMatch, GeocodeResult, MatchQuality};
use crate::config::GeocoderConfig;

/// Maps a boundary response onto the exact / approximate / unresolved tiers.
///
/// A match is exact when its place type is one of the configured point-like
/// types (populated places, peaks, mines); any other match is approximate.
#[derive(Debug, Clone)]
pub struct ConfidencePolicy {
    exact_place_types: BTreeSet<String>,
    rounding_decimals: u32,
}

impl ConfidencePolicy {
    #[must_use]
    pub fn new(exact_place_types: BTreeSet<String>, rounding_decimals: u32) -> Self {
        Self {
            exact_place_types: exact_place_types
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect(),
            rounding_decimals,
        }
    }

    #[must_use]
    pub fn from_config(config: &GeocoderConfig, rounding_decimals: u32) -> Self {
        Self::new(config.exact_place_type_set(), rounding_decimals)
    }

    #[must_use]
    pub fn tier(&self, matched: Option<&GeocodeMatch>) -> MatchQuality {
        match matched {
            None => MatchQuality::Unresolved,
            Some(m) if !m.is_plausible() => MatchQuality::Unresolved,
            Some(m) if self.exact_place_types.contains(&m.place_type.to_lowercase()) => {
                MatchQuality::Exact
            }
            Some(_) => MatchQuality::Approximate,
        }
    }

    #[must_use]
    pub fn classify(&self, query: &str, matched: Option<&GeocodeMatch>) -> GeocodeResult {
        match matched {
            Some(m) => GeocodeResult::resolved(query, m, self.tier(Some(m)), self.rounding_decimals),
            None => GeocodeResult::unresolved(query),
        }
    }

    pub fn rounding_decimals(&self) -> u32 {
        self.rounding_decimals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ConfidencePolicy {
        ConfidencePolicy::new(BTreeSet::from(["town".into(), "Village".into()]), 2)
    }

    #[test]
    fn test_point_features_are_exact() {
        let result = policy().classify("Markoye", Some(&GeocodeMatch::new(14.65, 0.04, "village")));
        assert_eq!(result.match_quality(), MatchQuality::Exact);
    }

    #[test]
    fn test_regions_are_approximate() {
        let result =
            policy().classify("Sahel", Some(&GeocodeMatch::new(14.1, -0.3, "state")));
        assert_eq!(result.match_quality(), MatchQuality::Approximate);
        assert!(result.is_resolved());
    }

    #[test]
    fn test_no_match_is_unresolved() {
        let result = policy().classify("Unnamed Outcrop 7", None);
        assert_eq!(result.match_quality(), MatchQuality::Unresolved);
        assert!(result.latitude().is_none());
    }

    #[test]
    fn test_place_type_case_insensitive() {
        assert_eq!(
            policy().tier(Some(&GeocodeMatch::new(13.58, -2.42, "TOWN"))),
            MatchQuality::Exact
        );
    }
}
