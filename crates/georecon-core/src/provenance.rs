use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::candidate::{ExtractorSource, LocationCandidate};

/// One observation supporting a canonical location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub document_id: String,
    pub page: u32,
    pub source: ExtractorSource,
    pub raw_text: String,
}

impl ProvenanceEntry {
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        page: u32,
        source: ExtractorSource,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            page,
            source,
            raw_text: raw_text.into(),
        }
    }

    /// One entry per page the candidate was seen on.
    pub fn from_candidate(candidate: &LocationCandidate) -> impl Iterator<Item = Self> + '_ {
        candidate.page_numbers().iter().map(move |&page| Self {
            document_id: candidate.document_id().to_string(),
            page,
            source: candidate.source().clone(),
            raw_text: candidate.raw_text().to_string(),
        })
    }
}

#[derive(Debug, Default, Clone)]
struct Ledger {
    entries: Vec<ProvenanceEntry>,
    seen: HashSet<ProvenanceEntry>,
}

impl Ledger {
    fn append(&mut self, entry: ProvenanceEntry) -> bool {
        if self.seen.contains(&entry) {
            return false;
        }
        self.seen.insert(entry.clone());
        self.entries.push(entry);
        true
    }
}

/// Append-only provenance index keyed by canonical key.
///
/// Entries are never overwritten. Re-ingesting an identical
/// `(document, page, source, raw_text)` tuple is a no-op; the same page seen
/// by two sources is two entries.
#[derive(Debug, Default, Clone)]
pub struct ProvenanceStore {
    ledgers: BTreeMap<String, Ledger>,
}

impl ProvenanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the entry was new.
    pub fn record(&mut self, key: &str, entry: ProvenanceEntry) -> bool {
        self.ledgers.entry(key.to_string()).or_default().append(entry)
    }

    pub fn record_candidate(&mut self, key: &str, candidate: &LocationCandidate) -> Vec<ProvenanceEntry> {
        ProvenanceEntry::from_candidate(candidate)
            .filter(|entry| self.record(key, entry.clone()))
            .collect()
    }

    /// Moves every entry under `from` onto `into`, preserving order.
    pub fn rekey(&mut self, from: &str, into: &str) {
        if from == into {
            return;
        }
        let Some(moved) = self.ledgers.remove(from) else {
            return;
        };
        let target = self.ledgers.entry(into.to_string()).or_default();
        for entry in moved.entries {
            target.append(entry);
        }
    }

    /// Appends every ledger of `other`, e.g. per-document stores into one
    /// run-wide index.
    pub fn extend(&mut self, other: Self) {
        for (key, ledger) in other.ledgers {
            let target = self.ledgers.entry(key).or_default();
            for entry in ledger.entries {
                target.append(entry);
            }
        }
    }

    pub fn entries(&self, key: &str) -> &[ProvenanceEntry] {
        self.ledgers.get(key).map_or(&[], |l| l.entries.as_slice())
    }

    pub fn documents(&self, key: &str) -> BTreeSet<&str> {
        self.entries(key)
            .iter()
            .map(|e| e.document_id.as_str())
            .collect()
    }

    pub fn pages(&self, key: &str, document_id: &str) -> BTreeSet<u32> {
        self.entries(key)
            .iter()
            .filter(|e| e.document_id == document_id)
            .map(|e| e.page)
            .collect()
    }

    pub fn sources(&self, key: &str) -> BTreeSet<&ExtractorSource> {
        self.entries(key).iter().map(|e| &e.source).collect()
    }

    pub fn keys_for_document<'a>(&'a self, document_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.ledgers
            .iter()
            .filter(move |(_, l)| l.entries.iter().any(|e| e.document_id == document_id))
            .map(|(k, _)| k.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ledgers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ledgers.values().map(|l| l.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }
}
