//! Two-phase deduplication of reconciled groups into canonical locations.
//!
//! Phase 1 merges on the exact `location_clean` key before geocoding.
//! Phase 2 runs after geocoding and collapses records whose names differ but
//! whose rounded coordinates coincide. Each phase is an explicit call, and
//! phase 2 can be re-run on its own.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::candidate::{ExtractorSource, QuantAttribute};
use crate::config::DedupConfig;
use crate::error::{Error, Result};
use crate::geocode::{GeocodeResult, MatchQuality, RoundedLatLon};
use crate::normalize::normalize;
use crate::provenance::{ProvenanceEntry, ProvenanceStore};
use crate::reconcile::ReconciledGroup;

/// Most frequent raw text; ties go to the longest, then the
/// lexicographically smallest.
#[must_use]
pub fn select_display_name(counts: &BTreeMap<String, usize>) -> Option<String> {
    counts
        .iter()
        .max_by(|(a, a_count), (b, b_count)| {
            a_count
                .cmp(b_count)
                .then_with(|| a.chars().count().cmp(&b.chars().count()))
                .then_with(|| b.cmp(a))
        })
        .map(|(text, _)| text.clone())
}

/// The agreed-upon record for one real-world place.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalLocation {
    location_clean: String,
    display_name: String,
    supporting_sources: BTreeSet<ExtractorSource>,
    provenance: Vec<ProvenanceEntry>,
    geocode_result: Option<GeocodeResult>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    attributes: BTreeSet<QuantAttribute>,
    #[serde(skip)]
    raw_text_counts: BTreeMap<String, usize>,
    #[serde(skip)]
    frozen: bool,
}

impl CanonicalLocation {
    fn from_group(group: &ReconciledGroup, provenance: Vec<ProvenanceEntry>) -> Self {
        let raw_text_counts = group.raw_text_counts();
        Self {
            location_clean: group.location_clean.clone(),
            display_name: select_display_name(&raw_text_counts)
                .unwrap_or_else(|| group.location_clean.clone()),
            supporting_sources: group.supporting_sources.clone(),
            provenance,
            geocode_result: None,
            attributes: group
                .candidates
                .iter()
                .flat_map(|c| c.attributes().iter().cloned())
                .collect(),
            raw_text_counts,
            frozen: false,
        }
    }

    fn absorb(&mut self, group: &ReconciledGroup, provenance: Vec<ProvenanceEntry>) {
        for (text, count) in group.raw_text_counts() {
            *self.raw_text_counts.entry(text).or_insert(0) += count;
        }
        self.supporting_sources
            .extend(group.supporting_sources.iter().cloned());
        self.attributes.extend(
            group
                .candidates
                .iter()
                .flat_map(|c| c.attributes().iter().cloned()),
        );
        self.provenance.extend(provenance);
        self.reselect_display_name();
    }

    fn reselect_display_name(&mut self) {
        if let Some(name) = select_display_name(&self.raw_text_counts) {
            self.display_name = name;
        }
    }

    /// Fold several records sharing a coordinate into one. `members` must be
    /// non-empty and sorted by key.
    fn collapse(members: Vec<Self>) -> Option<Self> {
        let geocode_result = members
            .iter()
            .filter_map(|m| m.geocode_result.as_ref())
            .fold(None::<&GeocodeResult>, |best, r| match best {
                Some(b) if b.match_quality().rank() >= r.match_quality().rank() => Some(b),
                _ => Some(r),
            })
            .cloned();

        let mut iter = members.into_iter();
        let mut survivor = iter.next()?;
        let mut seen: HashSet<ProvenanceEntry> = survivor.provenance.iter().cloned().collect();

        for member in iter {
            for (text, count) in member.raw_text_counts {
                *survivor.raw_text_counts.entry(text).or_insert(0) += count;
            }
            survivor.supporting_sources.extend(member.supporting_sources);
            survivor.attributes.extend(member.attributes);
            for entry in member.provenance {
                if seen.insert(entry.clone()) {
                    survivor.provenance.push(entry);
                }
            }
        }

        survivor.reselect_display_name();
        survivor.location_clean = normalize(&survivor.display_name);
        survivor.geocode_result = geocode_result;
        Some(survivor)
    }

    pub fn location_clean(&self) -> &str {
        &self.location_clean
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn supporting_sources(&self) -> &BTreeSet<ExtractorSource> {
        &self.supporting_sources
    }

    pub fn provenance(&self) -> &[ProvenanceEntry] {
        &self.provenance
    }

    pub fn geocode_result(&self) -> Option<&GeocodeResult> {
        self.geocode_result.as_ref()
    }

    pub fn attributes(&self) -> &BTreeSet<QuantAttribute> {
        &self.attributes
    }

    pub fn raw_text_counts(&self) -> &BTreeMap<String, usize> {
        &self.raw_text_counts
    }

    /// Not geocoded yet counts as unresolved.
    pub fn match_quality(&self) -> MatchQuality {
        self.geocode_result
            .as_ref()
            .map_or(MatchQuality::Unresolved, GeocodeResult::match_quality)
    }

    pub fn rounded_latlon(&self) -> Option<RoundedLatLon> {
        self.geocode_result.as_ref().and_then(GeocodeResult::rounded_latlon)
    }

    /// The post-geocode uniqueness key.
    pub fn dedup_key(&self) -> (&str, Option<RoundedLatLon>) {
        (&self.location_clean, self.rounded_latlon())
    }

    pub fn is_corroborated(&self) -> bool {
        self.supporting_sources.len() >= 2
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn documents(&self) -> BTreeSet<&str> {
        self.provenance.iter().map(|p| p.document_id.as_str()).collect()
    }

    pub fn pages(&self) -> BTreeSet<(&str, u32)> {
        self.provenance
            .iter()
            .map(|p| (p.document_id.as_str(), p.page))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    PreGeocode,
    PostGeocode,
}

/// Two merging groups disagreed on the display name. Resolved by the
/// tie-break rule; recorded for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCollision {
    pub phase: MergePhase,
    pub location_clean: String,
    pub merged_key: String,
    pub display_names: Vec<String>,
    pub chosen_display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounded_latlon: Option<RoundedLatLon>,
}

/// Unmerged keys whose names are close enough to deserve a look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub first: String,
    pub second: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub merges: usize,
    pub collisions: Vec<KeyCollision>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub groups_in: usize,
    pub candidates_in: usize,
    pub phase1_merges: usize,
    pub phase2_merges: usize,
    pub canonical_after_phase1: usize,
    pub canonical_after_phase2: usize,
    pub collisions: Vec<KeyCollision>,
    pub near_duplicates: Vec<NearDuplicate>,
}

impl DedupReport {
    /// Accumulate another scope's report into this one.
    pub fn merge(&mut self, other: Self) {
        self.groups_in += other.groups_in;
        self.candidates_in += other.candidates_in;
        self.phase1_merges += other.phase1_merges;
        self.phase2_merges += other.phase2_merges;
        self.canonical_after_phase1 += other.canonical_after_phase1;
        self.canonical_after_phase2 += other.canonical_after_phase2;
        self.collisions.extend(other.collisions);
        self.near_duplicates.extend(other.near_duplicates);
    }

    pub fn collisions_in(&self, phase: MergePhase) -> impl Iterator<Item = &KeyCollision> {
        self.collisions.iter().filter(move |c| c.phase == phase)
    }
}

/// Arena of canonical locations for one scope. Every mutation goes through
/// [`Deduplicator::merge_group`], [`Deduplicator::apply_geocodes`] or
/// [`Deduplicator::merge_post_geocode`].
pub struct Deduplicator {
    records: Vec<CanonicalLocation>,
    index: HashMap<String, usize>,
    provenance: ProvenanceStore,
    report: DedupReport,
    min_name_similarity: Option<f64>,
    near_duplicate_threshold: Option<f64>,
}

impl Deduplicator {
    #[must_use]
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            provenance: ProvenanceStore::new(),
            report: DedupReport::default(),
            min_name_similarity: config.min_name_similarity,
            near_duplicate_threshold: config.near_duplicate_threshold,
        }
    }

    /// Rebuild an arena from finalized records so phase 2 can be re-run
    /// after re-geocoding. The input records are left untouched.
    #[must_use]
    pub fn reopen(records: &[CanonicalLocation], config: &DedupConfig) -> Self {
        let mut dedup = Self::new(config);
        for record in records {
            let mut record = record.clone();
            record.frozen = false;
            for entry in &record.provenance {
                dedup.provenance.record(&record.location_clean, entry.clone());
            }
            dedup
                .index
                .insert(record.location_clean.clone(), dedup.records.len());
            dedup.records.push(record);
        }
        dedup.report.canonical_after_phase1 = dedup.records.len();
        dedup
    }

    /// Phase 1: fold a reconciled group into the record with the same
    /// `location_clean`, creating it if needed.
    pub fn merge_group(&mut self, group: ReconciledGroup) -> Result<()> {
        let key = group.location_clean.clone();
        self.report.groups_in += 1;
        self.report.candidates_in += group.candidates.len();

        if let Some(&idx) = self.index.get(&key) {
            if self.records[idx].frozen {
                return Err(Error::Frozen(key));
            }

            let entries = self.record_provenance(&key, &group);
            let record = &mut self.records[idx];
            let before = record.display_name.clone();
            let preferred = group.preferred_display_name();

            record.absorb(&group, entries);
            self.report.phase1_merges += group.candidates.len();

            if let Some(preferred) = preferred.filter(|p| *p != before) {
                tracing::debug!(
                    key = %key,
                    "Display name conflict {:?} vs {:?}; chose {:?}",
                    before,
                    preferred,
                    record.display_name
                );
                self.report.collisions.push(KeyCollision {
                    phase: MergePhase::PreGeocode,
                    location_clean: key.clone(),
                    merged_key: key,
                    display_names: vec![before, preferred],
                    chosen_display_name: record.display_name.clone(),
                    rounded_latlon: None,
                });
            }
        } else {
            let entries = self.record_provenance(&key, &group);
            self.report.phase1_merges += group.candidates.len().saturating_sub(1);
            self.index.insert(key, self.records.len());
            self.records.push(CanonicalLocation::from_group(&group, entries));
        }

        self.report.canonical_after_phase1 = self.records.len();
        Ok(())
    }

    /// Phase 1 over a batch of groups, reporting what this batch merged.
    pub fn merge_pre_geocode(
        &mut self,
        groups: impl IntoIterator<Item = ReconciledGroup>,
    ) -> Result<PhaseReport> {
        let merges_before = self.report.phase1_merges;
        let collisions_before = self.report.collisions.len();

        for group in groups {
            self.merge_group(group)?;
        }

        Ok(PhaseReport {
            merges: self.report.phase1_merges - merges_before,
            collisions: self.report.collisions[collisions_before..].to_vec(),
        })
    }

    fn record_provenance(&mut self, key: &str, group: &ReconciledGroup) -> Vec<ProvenanceEntry> {
        group
            .candidates
            .iter()
            .flat_map(|c| self.provenance.record_candidate(key, c))
            .collect()
    }

    /// Display names still waiting for a geocode result.
    pub fn pending_geocode(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.geocode_result.is_none())
            .map(|r| r.display_name.clone())
            .collect()
    }

    /// Attach results keyed by display name. Returns how many records were
    /// updated.
    pub fn apply_geocodes(&mut self, results: &HashMap<String, GeocodeResult>) -> Result<usize> {
        let mut applied = 0;
        for record in &mut self.records {
            if record.geocode_result.is_some() {
                continue;
            }
            if record.frozen {
                return Err(Error::Frozen(record.location_clean.clone()));
            }
            if let Some(result) = results.get(&record.display_name) {
                record.geocode_result = Some(result.clone());
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Drop unresolved geocode results so the next geocoding pass retries
    /// them. Resolved results are kept.
    pub fn reset_unresolved(&mut self) {
        for record in &mut self.records {
            if record
                .geocode_result
                .as_ref()
                .is_some_and(|r| !r.is_resolved())
            {
                record.geocode_result = None;
            }
        }
    }

    fn names_compatible(&self, a: &str, b: &str) -> bool {
        self.min_name_similarity
            .is_none_or(|floor| strsim::jaro_winkler(a, b) >= floor)
    }

    /// Phase 2: collapse records sharing a rounded coordinate. Unresolved
    /// records never merge here. Running it again without new geocodes is a
    /// no-op.
    pub fn merge_post_geocode(&mut self) -> Result<PhaseReport> {
        if let Some(record) = self.records.iter().find(|r| r.frozen) {
            return Err(Error::Frozen(record.location_clean.clone()));
        }

        let mut buckets: BTreeMap<RoundedLatLon, Vec<usize>> = BTreeMap::new();
        for (idx, record) in self.records.iter().enumerate() {
            if let Some(rounded) = record.rounded_latlon() {
                buckets.entry(rounded).or_default().push(idx);
            }
        }

        let mut sets = UnionFind::<usize>::new(self.records.len());
        for members in buckets.values() {
            for (pos, &a) in members.iter().enumerate() {
                for &b in &members[pos + 1..] {
                    if self.names_compatible(
                        &self.records[a].location_clean,
                        &self.records[b].location_clean,
                    ) {
                        sets.union(a, b);
                    }
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..self.records.len() {
            clusters.entry(sets.find(idx)).or_default().push(idx);
        }

        let mut slots: Vec<Option<CanonicalLocation>> =
            std::mem::take(&mut self.records).into_iter().map(Some).collect();
        let mut phase = PhaseReport::default();
        let mut merged = Vec::with_capacity(slots.len());

        for members in clusters.values() {
            let mut members: Vec<CanonicalLocation> =
                members.iter().filter_map(|&i| slots[i].take()).collect();
            members.sort_by(|a, b| a.location_clean.cmp(&b.location_clean));

            if members.len() < 2 {
                merged.extend(members);
                continue;
            }

            let rounded = members[0].rounded_latlon();
            let keys: Vec<String> = members.iter().map(|m| m.location_clean.clone()).collect();
            let names: Vec<String> = members.iter().map(|m| m.display_name.clone()).collect();

            let Some(survivor) = CanonicalLocation::collapse(members) else {
                continue;
            };

            for key in keys.iter().filter(|k| **k != survivor.location_clean) {
                self.provenance.rekey(key, &survivor.location_clean);
                phase.merges += 1;
                phase.collisions.push(KeyCollision {
                    phase: MergePhase::PostGeocode,
                    location_clean: survivor.location_clean.clone(),
                    merged_key: key.clone(),
                    display_names: names.clone(),
                    chosen_display_name: survivor.display_name.clone(),
                    rounded_latlon: rounded,
                });
            }

            tracing::debug!(
                key = %survivor.location_clean,
                "Merged {} records sharing {}",
                keys.len(),
                rounded.map(|r| r.to_string()).unwrap_or_default()
            );
            merged.push(survivor);
        }

        merged.sort_by(|a, b| a.location_clean.cmp(&b.location_clean));
        self.index = merged
            .iter()
            .enumerate()
            .map(|(i, r)| (r.location_clean.clone(), i))
            .collect();
        self.records = merged;

        self.report.phase2_merges += phase.merges;
        self.report.collisions.extend(phase.collisions.iter().cloned());
        self.report.canonical_after_phase2 = self.records.len();
        self.report.near_duplicates = self.near_duplicates();

        Ok(phase)
    }

    fn near_duplicates(&self) -> Vec<NearDuplicate> {
        let Some(threshold) = self.near_duplicate_threshold else {
            return Vec::new();
        };

        let keys: Vec<&str> = self.records.iter().map(|r| r.location_clean.as_str()).collect();
        let mut found = Vec::new();
        for (pos, a) in keys.iter().enumerate() {
            for b in &keys[pos + 1..] {
                let similarity = strsim::jaro_winkler(a, b);
                if similarity >= threshold {
                    found.push(NearDuplicate {
                        first: (*a).to_string(),
                        second: (*b).to_string(),
                        similarity,
                    });
                }
            }
        }
        found
    }

    pub fn get(&self, key: &str) -> Option<&CanonicalLocation> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[CanonicalLocation] {
        &self.records
    }

    pub fn provenance(&self) -> &ProvenanceStore {
        &self.provenance
    }

    pub fn report(&self) -> &DedupReport {
        &self.report
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Freeze and hand over the records. Nothing can be merged into them
    /// afterwards.
    #[must_use]
    pub fn finalize(mut self) -> (Vec<CanonicalLocation>, DedupReport, ProvenanceStore) {
        self.records.sort_by(|a, b| a.location_clean.cmp(&b.location_clean));
        for record in &mut self.records {
            record.frozen = true;
        }
        self.report.canonical_after_phase2 = self.records.len();
        (self.records, self.report, self.provenance)
    }
}
