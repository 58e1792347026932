use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::normalize;

/// The extractor family that observed a mention.
///
/// The set is open: rule-based analyzers and any other extractor are told
/// apart by their label, so `RuleBased("spacy")` and `RuleBased("stanza")`
/// count as two independent sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExtractorSource {
    Llm,
    RuleBased(String),
    Other(String),
}

impl ExtractorSource {
    #[must_use]
    pub fn rule_based(label: impl Into<String>) -> Self {
        Self::RuleBased(label.into())
    }

    #[must_use]
    pub fn family(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::RuleBased(_) => "rule_based",
            Self::Other(_) => "other",
        }
    }
}

impl std::fmt::Display for ExtractorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => f.write_str("llm"),
            Self::RuleBased(label) => write!(f, "rule_based:{label}"),
            Self::Other(label) => write!(f, "other:{label}"),
        }
    }
}

impl std::str::FromStr for ExtractorSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (family, label) = match s.split_once(':') {
            Some((family, label)) => (family, Some(label.trim())),
            None => (s, None),
        };

        match (family, label) {
            ("llm", None) => Ok(Self::Llm),
            ("rule_based", Some(label)) if !label.is_empty() => Ok(Self::RuleBased(label.into())),
            ("rule_based", None) => Ok(Self::RuleBased("default".into())),
            ("other", Some(label)) if !label.is_empty() => Ok(Self::Other(label.into())),
            _ => Err(crate::Error::InvalidSource(s.to_string())),
        }
    }
}

impl TryFrom<String> for ExtractorSource {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExtractorSource> for String {
    fn from(source: ExtractorSource) -> Self {
        source.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    RockType,
    Structure,
    FormationAge,
    Other,
}

impl AttributeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RockType => "rock_type",
            Self::Structure => "structure",
            Self::FormationAge => "formation_age",
            Self::Other => "other",
        }
    }
}

/// Auxiliary tag from the quantitative-attribute extractor. Carried through
/// to the canonical location untouched; never reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuantAttribute {
    pub kind: AttributeKind,
    pub value: String,
}

impl QuantAttribute {
    #[must_use]
    pub fn new(kind: AttributeKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// One mention as emitted by an extractor, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMention {
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub page_numbers: Vec<u32>,
    #[serde(default)]
    pub source: Option<ExtractorSource>,
    #[serde(default)]
    pub source_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<QuantAttribute>,
}

impl RawMention {
    #[must_use]
    pub fn new(raw_text: impl Into<String>, source: ExtractorSource, pages: &[u32]) -> Self {
        Self {
            raw_text: Some(raw_text.into()),
            page_numbers: pages.to_vec(),
            source: Some(source),
            source_confidence: None,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.source_confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: QuantAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }
}

/// All extractor output for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentInput {
    pub document_id: String,
    #[serde(default)]
    pub mentions: Vec<RawMention>,
}

impl DocumentInput {
    #[must_use]
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            mentions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mention(mut self, mention: RawMention) -> Self {
        self.mentions.push(mention);
        self
    }
}

/// A validated mention. `location_clean` is derived from `raw_text` at
/// construction and cannot be set independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationCandidate {
    raw_text: String,
    location_clean: String,
    source: ExtractorSource,
    source_confidence: Option<f64>,
    document_id: String,
    page_numbers: BTreeSet<u32>,
    is_geographic: Option<bool>,
    attributes: Vec<QuantAttribute>,
}

impl LocationCandidate {
    pub fn new(
        document_id: impl Into<String>,
        raw_text: impl Into<String>,
        source: ExtractorSource,
        pages: impl IntoIterator<Item = u32>,
    ) -> Result<Self, RejectionReason> {
        let raw_text = raw_text.into();
        let location_clean = normalize(&raw_text);
        if location_clean.is_empty() {
            return Err(RejectionReason::EmptyKey);
        }

        let page_numbers: BTreeSet<u32> = pages.into_iter().collect();
        if page_numbers.is_empty() {
            return Err(RejectionReason::MissingPages);
        }

        Ok(Self {
            raw_text,
            location_clean,
            source,
            source_confidence: None,
            document_id: document_id.into(),
            page_numbers,
            is_geographic: None,
            attributes: Vec::new(),
        })
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Result<Self, RejectionReason> {
        if let Some(score) = confidence {
            if !score.is_finite() {
                return Err(RejectionReason::InvalidConfidence);
            }
        }
        self.source_confidence = confidence;
        Ok(self)
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<QuantAttribute>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Noise-filter outcome. Produces the filtered record; the unfiltered one
    /// is consumed.
    #[must_use]
    pub fn classified(mut self, is_geographic: bool) -> Self {
        self.is_geographic = Some(is_geographic);
        self
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn location_clean(&self) -> &str {
        &self.location_clean
    }

    pub fn source(&self) -> &ExtractorSource {
        &self.source
    }

    pub fn source_confidence(&self) -> Option<f64> {
        self.source_confidence
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn page_numbers(&self) -> &BTreeSet<u32> {
        &self.page_numbers
    }

    pub fn is_geographic(&self) -> Option<bool> {
        self.is_geographic
    }

    pub fn attributes(&self) -> &[QuantAttribute] {
        &self.attributes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    Unparseable(String),
    MissingText,
    MissingSource,
    MissingPages,
    EmptyKey,
    InvalidConfidence,
    ExcludedTerm(String),
    StopTerm(String),
    ExcludedPattern(String),
    ExcludedToken(String),
}

impl RejectionReason {
    /// Rejections produced by the noise filter rather than by malformed input.
    #[must_use]
    pub fn is_noise(&self) -> bool {
        matches!(
            self,
            Self::ExcludedTerm(_)
                | Self::StopTerm(_)
                | Self::ExcludedPattern(_)
                | Self::ExcludedToken(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ExtractorSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_numbers: Vec<u32>,
    pub reason: RejectionReason,
}

impl Rejection {
    #[must_use]
    pub fn of_candidate(candidate: &LocationCandidate, reason: RejectionReason) -> Self {
        Self {
            document_id: candidate.document_id.clone(),
            raw_text: Some(candidate.raw_text.clone()),
            source: Some(candidate.source.clone()),
            page_numbers: candidate.page_numbers.iter().copied().collect(),
            reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Extraction failed: {0}")]
    Failed(String),
    #[error("Extractor unavailable: {0}")]
    Unavailable(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// The capability every extractor satisfies: report which family it is and
/// hand over its raw mentions for a document.
#[async_trait::async_trait]
pub trait MentionSource: Send + Sync {
    fn source(&self) -> ExtractorSource;

    async fn mentions(&self, document_id: &str) -> SourceResult<Vec<RawMention>>;
}

#[derive(Debug, Clone, Default)]
pub struct AdaptedDocument {
    pub document_id: String,
    pub candidates: Vec<LocationCandidate>,
    pub rejections: Vec<Rejection>,
    pub mentions_in: usize,
}

impl AdaptedDocument {
    #[must_use]
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }

    fn push(&mut self, mention: RawMention) {
        self.mentions_in += 1;
        match CandidateAdapter::adapt_one(&self.document_id, mention.clone()) {
            Ok(candidate) => self.candidates.push(candidate),
            Err(reason) => {
                tracing::debug!(
                    document = %self.document_id,
                    ?reason,
                    "Dropping malformed mention"
                );
                self.rejections.push(Rejection {
                    document_id: self.document_id.clone(),
                    raw_text: mention.raw_text,
                    source: mention.source,
                    page_numbers: mention.page_numbers,
                    reason,
                });
            }
        }
    }
}

/// Turns extractor output into uniform [`LocationCandidate`] records,
/// whatever produced it. Malformed mentions become rejections.
pub struct CandidateAdapter;

impl CandidateAdapter {
    pub fn adapt_one(
        document_id: &str,
        mention: RawMention,
    ) -> Result<LocationCandidate, RejectionReason> {
        let raw_text = mention.raw_text.ok_or(RejectionReason::MissingText)?;
        let source = mention.source.ok_or(RejectionReason::MissingSource)?;

        LocationCandidate::new(document_id, raw_text, source, mention.page_numbers)?
            .with_confidence(mention.source_confidence)
            .map(|c| c.with_attributes(mention.attributes))
    }

    #[must_use]
    pub fn adapt(document: DocumentInput) -> AdaptedDocument {
        Self::adapt_mentions(document.document_id, document.mentions)
    }

    pub fn adapt_mentions(
        document_id: impl Into<String>,
        mentions: impl IntoIterator<Item = RawMention>,
    ) -> AdaptedDocument {
        let mut adapted = AdaptedDocument::new(document_id);
        for mention in mentions {
            adapted.push(mention);
        }
        adapted
    }

    /// Adapts loosely-typed records one at a time so a single bad record
    /// only rejects itself.
    #[must_use]
    pub fn adapt_json(document_id: impl Into<String>, values: &[serde_json::Value]) -> AdaptedDocument {
        let mut adapted = AdaptedDocument::new(document_id);
        for value in values {
            match serde_json::from_value::<RawMention>(value.clone()) {
                Ok(mention) => adapted.push(mention),
                Err(e) => {
                    adapted.mentions_in += 1;
                    adapted.rejections.push(Rejection {
                        document_id: adapted.document_id.clone(),
                        raw_text: value
                            .get("raw_text")
                            .and_then(serde_json::Value::as_str)
                            .map(String::from),
                        source: None,
                        page_numbers: Vec::new(),
                        reason: RejectionReason::Unparseable(e.to_string()),
                    });
                }
            }
        }
        adapted
    }

    /// Gathers mentions from every extractor for one document. An extractor
    /// that fails is skipped; the others still contribute.
    pub async fn collect(document_id: &str, sources: &[Box<dyn MentionSource>]) -> AdaptedDocument {
        let mut adapted = AdaptedDocument::new(document_id);

        for extractor in sources {
            let family = extractor.source();
            match extractor.mentions(document_id).await {
                Ok(mentions) => {
                    for mut mention in mentions {
                        mention.source.get_or_insert_with(|| family.clone());
                        adapted.push(mention);
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping extractor {} for {}: {}", family, document_id, e);
                }
            }
        }

        adapted
    }
}
