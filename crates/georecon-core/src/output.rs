//! Flat output table for canonical locations.

use std::io;

use serde::{Deserialize, Serialize};

use crate::dedup::CanonicalLocation;
use crate::error::Result;
use crate::geocode::MatchQuality;

/// One row per canonical location. Multi-valued columns are joined so the
/// row stays flat for CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRow {
    pub location_clean: String,
    pub display_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub match_quality: MatchQuality,
    pub rounded_latlon: Option<String>,
    /// `;`-joined extractor sources
    pub supporting_sources: String,
    /// `;`-joined `document:page` pairs
    pub pages: String,
    /// `;`-joined distinct documents
    pub document_id: String,
    pub geocode_query_str: Option<String>,
    /// `;`-joined `kind=value` pairs
    pub attributes: String,
}

impl From<&CanonicalLocation> for LocationRow {
    fn from(record: &CanonicalLocation) -> Self {
        let geocode = record.geocode_result();
        let join = |items: Vec<String>| items.join(";");

        Self {
            location_clean: record.location_clean().to_string(),
            display_name: record.display_name().to_string(),
            latitude: geocode.and_then(|g| g.latitude()),
            longitude: geocode.and_then(|g| g.longitude()),
            match_quality: record.match_quality(),
            rounded_latlon: record.rounded_latlon().map(|r| r.to_string()),
            supporting_sources: join(
                record
                    .supporting_sources()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            ),
            pages: join(
                record
                    .pages()
                    .into_iter()
                    .map(|(doc, page)| format!("{doc}:{page}"))
                    .collect(),
            ),
            document_id: join(record.documents().into_iter().map(String::from).collect()),
            geocode_query_str: geocode.map(|g| g.geocode_query_str().to_string()),
            attributes: join(
                record
                    .attributes()
                    .iter()
                    .map(|a| format!("{}={}", a.kind.as_str(), a.value))
                    .collect(),
            ),
        }
    }
}

impl LocationRow {
    pub fn render_style(&self) -> RenderStyle {
        RenderStyle::for_quality(self.match_quality)
    }
}

/// How the map renderer should draw a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStyle {
    Solid,
    Faint,
    /// No coordinates; listed for review instead of plotted
    Flagged,
}

impl RenderStyle {
    #[must_use]
    pub fn for_quality(quality: MatchQuality) -> Self {
        match quality {
            MatchQuality::Exact => Self::Solid,
            MatchQuality::Approximate => Self::Faint,
            MatchQuality::Unresolved => Self::Flagged,
        }
    }

    pub fn is_plotted(&self) -> bool {
        !matches!(self, Self::Flagged)
    }
}

pub fn write_csv<W: io::Write>(writer: W, rows: &[LocationRow]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_json<W: io::Write>(writer: W, rows: &[LocationRow]) -> Result<()> {
    serde_json::to_writer_pretty(writer, rows)?;
    Ok(())
}

pub fn read_csv<R: io::Read>(reader: R) -> Result<Vec<LocationRow>> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for row in csv.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::candidate::{AttributeKind, CandidateAdapter, DocumentInput, ExtractorSource, QuantAttribute, RawMention};
    use crate::config::{DedupConfig, NoiseConfig};
    use crate::dedup::Deduplicator;
    use crate::geocode::{GeocodeMatch, GeocodeResult};
    use crate::reconcile::Reconciler;

    fn records() -> Vec<CanonicalLocation> {
        let reconciler = Reconciler::from_config(&NoiseConfig {
            excluded_terms: vec!["granite".into()],
            ..NoiseConfig::default()
        })
        .unwrap();
        let doc = DocumentInput::new("doc1")
            .with_mention(
                RawMention::new("Essakane", ExtractorSource::Llm, &[3, 4]).with_attribute(
                    QuantAttribute::new(AttributeKind::RockType, "granite"),
                ),
            )
            .with_mention(RawMention::new("Essakane", ExtractorSource::rule_based("spacy"), &[3]))
            .with_mention(RawMention::new("Unnamed Outcrop 7", ExtractorSource::Llm, &[9]));
        let reconciled = reconciler.reconcile(CandidateAdapter::adapt(doc));

        let mut dedup = Deduplicator::new(&DedupConfig::default());
        dedup.merge_pre_geocode(reconciled.groups).unwrap();
        let results = HashMap::from([
            (
                "Essakane".to_string(),
                GeocodeResult::resolved(
                    "Essakane",
                    &GeocodeMatch::new(14.3849, -0.0698, "mine"),
                    MatchQuality::Exact,
                    2,
                ),
            ),
            (
                "Unnamed Outcrop 7".to_string(),
                GeocodeResult::unresolved("Unnamed Outcrop 7"),
            ),
        ]);
        dedup.apply_geocodes(&results).unwrap();
        dedup.finalize().0
    }

    #[test]
    fn test_row_columns() {
        let rows: Vec<LocationRow> = records().iter().map(LocationRow::from).collect();
        let essakane = rows.iter().find(|r| r.location_clean == "essakane").unwrap();

        assert_eq!(essakane.rounded_latlon.as_deref(), Some("14.38,-0.07"));
        assert_eq!(essakane.supporting_sources, "llm;rule_based:spacy");
        assert_eq!(essakane.pages, "doc1:3;doc1:4");
        assert_eq!(essakane.document_id, "doc1");
        assert_eq!(essakane.attributes, "rock_type=granite");
        assert_eq!(essakane.render_style(), RenderStyle::Solid);

        let outcrop = rows.iter().find(|r| r.location_clean == "unnamed outcrop 7").unwrap();
        assert!(outcrop.latitude.is_none());
        assert!(outcrop.rounded_latlon.is_none());
        assert_eq!(outcrop.render_style(), RenderStyle::Flagged);
        assert!(!outcrop.render_style().is_plotted());
    }

    #[test]
    fn test_csv_round_trip() {
        let rows: Vec<LocationRow> = records().iter().map(LocationRow::from).collect();
        let mut buf = Vec::new();
        write_csv(&mut buf, &rows).unwrap();

        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("location_clean,display_name,latitude,longitude,match_quality"));

        let parsed = read_csv(buf.as_slice()).unwrap();
        assert_eq!(parsed, rows);
    }

    #[test]
    fn test_json_output() {
        let rows: Vec<LocationRow> = records().iter().map(LocationRow::from).collect();
        let mut buf = Vec::new();
        write_json(&mut buf, &rows).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["match_quality"], "exact");
    }
}
