use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::candidate::RejectionReason;
use crate::config::NoiseConfig;
use crate::error::{Error, Result};
use crate::normalize::normalize;

/// Which exclusion rule a key hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "matched", rename_all = "snake_case")]
pub enum NoiseMatch {
    Term(String),
    StopTerm(String),
    Pattern(String),
    Token(String),
}

impl NoiseMatch {
    /// Whole-key matches; token and pattern matches are heuristic.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Term(_) | Self::StopTerm(_))
    }

    #[must_use]
    pub fn into_rejection(self) -> RejectionReason {
        match self {
            Self::Term(t) => RejectionReason::ExcludedTerm(t),
            Self::StopTerm(t) => RejectionReason::StopTerm(t),
            Self::Pattern(p) => RejectionReason::ExcludedPattern(p),
            Self::Token(t) => RejectionReason::ExcludedToken(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub excluded: Option<NoiseMatch>,
    /// The key is also a known place. Exclusion still wins.
    pub ambiguous: bool,
}

impl Classification {
    #[must_use]
    pub fn is_geographic(&self) -> bool {
        self.excluded.is_none()
    }
}

pub struct NoiseFilter {
    excluded: HashSet<String>,
    stop_terms: HashSet<String>,
    known_places: HashSet<String>,
    patterns: Vec<Regex>,
    match_tokens: bool,
}

fn normalized_set(terms: &[String]) -> HashSet<String> {
    terms
        .iter()
        .map(|t| normalize(t))
        .filter(|t| !t.is_empty())
        .collect()
}

impl NoiseFilter {
    pub fn from_config(config: &NoiseConfig) -> Result<Self> {
        let excluded = normalized_set(&config.excluded_terms);
        if excluded.is_empty() {
            return Err(Error::MissingVocabulary);
        }

        let patterns = config
            .excluded_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            excluded,
            stop_terms: normalized_set(&config.stop_terms),
            known_places: normalized_set(&config.geographic_terms),
            patterns,
            match_tokens: config.match_tokens,
        })
    }

    /// Classify a normalized key.
    #[must_use]
    pub fn classify(&self, key: &str) -> Classification {
        let excluded = self.match_exclusion(key);
        let ambiguous = excluded.is_some() && self.known_places.contains(key);
        Classification { excluded, ambiguous }
    }

    fn match_exclusion(&self, key: &str) -> Option<NoiseMatch> {
        if self.excluded.contains(key) {
            return Some(NoiseMatch::Term(key.to_string()));
        }
        if self.stop_terms.contains(key) {
            return Some(NoiseMatch::StopTerm(key.to_string()));
        }
        if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(key)) {
            return Some(NoiseMatch::Pattern(pattern.as_str().to_string()));
        }
        if self.match_tokens {
            return self.match_trailing_term(key);
        }
        None
    }

    /// "dori granite", "tin-akof shear zone": a multi-word key ending in an
    /// excluded term names a geological unit, not a place.
    fn match_trailing_term(&self, key: &str) -> Option<NoiseMatch> {
        let words: Vec<&str> = key.split(' ').collect();
        (1..words.len())
            .map(|start| words[start..].join(" "))
            .find(|tail| self.excluded.contains(tail))
            .map(NoiseMatch::Token)
    }
}
