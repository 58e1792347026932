use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::noise::{NoiseFilter, NoiseMatch};
use crate::candidate::{AdaptedDocument, ExtractorSource, LocationCandidate, Rejection};
use crate::config::{ConflictPolicy, NoiseConfig};
use crate::dedup::select_display_name;
use crate::error::Result;

/// All geographic candidates of one document sharing a `location_clean`.
#[derive(Debug, Clone)]
pub struct ReconciledGroup {
    pub location_clean: String,
    pub candidates: Vec<LocationCandidate>,
    pub supporting_sources: BTreeSet<ExtractorSource>,
}

impl ReconciledGroup {
    /// Reported by two or more independent extractors.
    #[must_use]
    pub fn is_corroborated(&self) -> bool {
        self.supporting_sources.len() >= 2
    }

    /// Surface forms with surrounding whitespace trimmed, counted.
    #[must_use]
    pub fn raw_text_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for candidate in &self.candidates {
            *counts.entry(candidate.raw_text().trim().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn preferred_display_name(&self) -> Option<String> {
        select_display_name(&self.raw_text_counts())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousTerm {
    pub document_id: String,
    pub location_clean: String,
    pub matched: NoiseMatch,
    pub sources: BTreeSet<ExtractorSource>,
}

/// Several extractors reported a key the noise filter rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConflict {
    pub document_id: String,
    pub location_clean: String,
    pub matched: NoiseMatch,
    pub sources: BTreeSet<ExtractorSource>,
    pub kept: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentReconciliation {
    pub document_id: String,
    pub groups: Vec<ReconciledGroup>,
    pub rejections: Vec<Rejection>,
    pub ambiguous: Vec<AmbiguousTerm>,
    pub source_conflicts: Vec<SourceConflict>,
    pub mentions_in: usize,
}

impl DocumentReconciliation {
    pub fn geographic_candidates(&self) -> usize {
        self.groups.iter().map(|g| g.candidates.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn noise_rejections(&self) -> impl Iterator<Item = &Rejection> {
        self.rejections.iter().filter(|r| r.reason.is_noise())
    }
}

pub struct Reconciler {
    filter: NoiseFilter,
    conflict_policy: ConflictPolicy,
}

impl Reconciler {
    #[must_use]
    pub fn new(filter: NoiseFilter, conflict_policy: ConflictPolicy) -> Self {
        Self {
            filter,
            conflict_policy,
        }
    }

    pub fn from_config(config: &NoiseConfig) -> Result<Self> {
        Ok(Self::new(NoiseFilter::from_config(config)?, config.conflict_policy))
    }

    /// Filter noise out of one document's candidates and group the rest by
    /// `location_clean`. A document with nothing geographic left yields an
    /// empty reconciliation.
    #[must_use]
    pub fn reconcile(&self, adapted: AdaptedDocument) -> DocumentReconciliation {
        let AdaptedDocument {
            document_id,
            candidates,
            rejections,
            mentions_in,
        } = adapted;

        let mut out = DocumentReconciliation {
            document_id,
            rejections,
            mentions_in,
            ..DocumentReconciliation::default()
        };

        let mut buckets: BTreeMap<String, Vec<LocationCandidate>> = BTreeMap::new();
        for candidate in candidates {
            buckets
                .entry(candidate.location_clean().to_string())
                .or_default()
                .push(candidate);
        }

        for (key, bucket) in buckets {
            let sources: BTreeSet<ExtractorSource> =
                bucket.iter().map(|c| c.source().clone()).collect();
            let classification = self.filter.classify(&key);

            let Some(matched) = classification.excluded else {
                out.groups.push(Self::group(key, bucket, sources));
                continue;
            };

            let corroborated = sources.len() >= 2;
            let kept = corroborated
                && self.conflict_policy == ConflictPolicy::KeepIfMultiSource
                && !matched.is_exact();

            if classification.ambiguous {
                tracing::warn!(
                    document = %out.document_id,
                    key = %key,
                    "Term is both a known place and excluded vocabulary; excluding for manual review"
                );
                out.ambiguous.push(AmbiguousTerm {
                    document_id: out.document_id.clone(),
                    location_clean: key.clone(),
                    matched: matched.clone(),
                    sources: sources.clone(),
                });
            }

            if corroborated {
                tracing::debug!(
                    document = %out.document_id,
                    key = %key,
                    kept,
                    "Noise filter disagrees with {} sources",
                    sources.len()
                );
                out.source_conflicts.push(SourceConflict {
                    document_id: out.document_id.clone(),
                    location_clean: key.clone(),
                    matched: matched.clone(),
                    sources: sources.clone(),
                    kept,
                });
            }

            if kept {
                out.groups.push(Self::group(key, bucket, sources));
            } else {
                for candidate in bucket {
                    let candidate = candidate.classified(false);
                    out.rejections.push(Rejection::of_candidate(
                        &candidate,
                        matched.clone().into_rejection(),
                    ));
                }
            }
        }

        tracing::debug!(
            document = %out.document_id,
            groups = out.groups.len(),
            rejected = out.rejections.len(),
            "Reconciled document"
        );

        out
    }

    fn group(
        key: String,
        bucket: Vec<LocationCandidate>,
        supporting_sources: BTreeSet<ExtractorSource>,
    ) -> ReconciledGroup {
        ReconciledGroup {
            location_clean: key,
            candidates: bucket.into_iter().map(|c| c.classified(true)).collect(),
            supporting_sources,
        }
    }
}
