use std::collections::BTreeSet;
use std::sync::Arc;

use georecon_core::{
    CanonicalLocation, DocumentInput, Error, ExtractorSource, GeocodeMatch, LocationRow,
    MatchQuality, MergePhase, RawMention, ReconConfig, ReconcilePipeline, ReconcileScope,
    RejectionReason, RenderStyle, StaticGeocoder,
};
use tokio_util::sync::CancellationToken;

fn config() -> ReconConfig {
    ReconConfig::from_toml_str(
        r#"
        scope = "corpus"

        [noise]
        excluded_terms = ["granite", "tonalite", "shear zone", "greenstone belt"]
        stop_terms = ["figure", "map"]

        [dedup]
        rounding_decimals = 2
        "#,
    )
    .unwrap()
}

fn gazetteer() -> StaticGeocoder {
    StaticGeocoder::new()
        .with_place("Markoye", GeocodeMatch::new(14.6468, 0.0437, "village"))
        .with_place("Ouahigouya", GeocodeMatch::new(13.5827, -2.4216, "town"))
        .with_place("Ouahigouya Region", GeocodeMatch::new(13.5790, -2.4180, "state"))
        .with_place("Kaya", GeocodeMatch::new(13.0917, -1.0844, "town"))
}

async fn pipeline() -> ReconcilePipeline {
    ReconcilePipeline::new(config(), Arc::new(gazetteer()))
        .await
        .unwrap()
}

fn llm(text: &str, page: u32) -> RawMention {
    RawMention::new(text, ExtractorSource::Llm, &[page])
}

fn spacy(text: &str, page: u32) -> RawMention {
    RawMention::new(text, ExtractorSource::rule_based("spacy"), &[page])
}

fn corpus() -> Vec<DocumentInput> {
    vec![
        DocumentInput::new("doc1")
            .with_mention(llm("Markoye", 3))
            .with_mention(spacy("markoye ", 3))
            .with_mention(llm("granite", 3))
            .with_mention(llm("Ouahigouya", 5)),
        DocumentInput::new("doc2")
            .with_mention(spacy("Ouahigouya Region", 2))
            .with_mention(llm("Unnamed Outcrop 7", 11))
            .with_mention(llm("Kaya", 1)),
        DocumentInput::new("doc3")
            .with_mention(llm("Figure", 4))
            .with_mention(llm("Kaya", 6)),
    ]
}

// --- Scenarios ---

#[tokio::test]
async fn extractors_agree_on_one_location() {
    let output = pipeline().await.run(corpus()).await.unwrap();

    let markoye = output.get("markoye").unwrap();
    assert_eq!(
        markoye.supporting_sources(),
        &BTreeSet::from([ExtractorSource::Llm, ExtractorSource::rule_based("spacy")])
    );
    assert_eq!(markoye.display_name(), "Markoye");
    assert_eq!(markoye.provenance().len(), 2);
    assert!(markoye.is_corroborated());
}

#[tokio::test]
async fn noise_term_goes_to_rejection_report() {
    let output = pipeline().await.run(corpus()).await.unwrap();

    assert!(output.get("granite").is_none());
    assert!(output
        .report
        .rejections
        .iter()
        .any(|r| r.raw_text.as_deref() == Some("granite")
            && matches!(r.reason, RejectionReason::ExcludedTerm(_))));
    assert!(output
        .report
        .rejections
        .iter()
        .any(|r| matches!(r.reason, RejectionReason::StopTerm(_))));
}

#[tokio::test]
async fn shared_coordinate_collapses_across_documents() {
    let output = pipeline().await.run(corpus()).await.unwrap();

    let merged: Vec<&CanonicalLocation> = output
        .records
        .iter()
        .filter(|r| r.location_clean().starts_with("ouahigouya"))
        .collect();
    assert_eq!(merged.len(), 1);

    let record = merged[0];
    assert_eq!(record.documents(), BTreeSet::from(["doc1", "doc2"]));
    assert_eq!(record.rounded_latlon().unwrap().to_string(), "13.58,-2.42");
    assert_eq!(record.match_quality(), MatchQuality::Exact);
    assert_eq!(output.report.dedup.phase2_merges, 1);
    assert_eq!(
        output
            .report
            .dedup
            .collisions_in(MergePhase::PostGeocode)
            .count(),
        1
    );
}

#[tokio::test]
async fn unmatched_location_is_kept_unresolved() {
    let output = pipeline().await.run(corpus()).await.unwrap();

    let outcrop = output.get("unnamed outcrop 7").unwrap();
    assert_eq!(outcrop.match_quality(), MatchQuality::Unresolved);
    assert!(outcrop.rounded_latlon().is_none());
    assert_eq!(outcrop.pages(), BTreeSet::from([("doc2", 11)]));

    let row = LocationRow::from(outcrop);
    assert!(row.latitude.is_none() && row.longitude.is_none());
    assert_eq!(row.render_style(), RenderStyle::Flagged);
}

// --- Properties ---

#[tokio::test]
async fn keys_are_unique_after_both_phases() {
    let output = pipeline().await.run(corpus()).await.unwrap();

    let keys: BTreeSet<_> = output.records.iter().map(CanonicalLocation::dedup_key).collect();
    assert_eq!(keys.len(), output.records.len());

    let names: BTreeSet<_> = output.records.iter().map(CanonicalLocation::location_clean).collect();
    assert_eq!(names.len(), output.records.len());
}

#[tokio::test]
async fn every_geographic_mention_keeps_its_provenance() {
    let docs = corpus();
    let output = pipeline().await.run(docs.clone()).await.unwrap();

    let provenance: BTreeSet<(String, u32, String)> = output
        .records
        .iter()
        .flat_map(|r| r.provenance().iter())
        .map(|p| (p.document_id.clone(), p.page, p.raw_text.clone()))
        .collect();

    let rejected: BTreeSet<(String, String)> = output
        .report
        .rejections
        .iter()
        .filter_map(|r| Some((r.document_id.clone(), r.raw_text.clone()?)))
        .collect();

    for doc in &docs {
        for mention in &doc.mentions {
            let text = mention.raw_text.clone().unwrap();
            if rejected.contains(&(doc.document_id.clone(), text.clone())) {
                continue;
            }
            for page in &mention.page_numbers {
                assert!(
                    provenance.contains(&(doc.document_id.clone(), *page, text.clone())),
                    "lost {text:?} on {}:{page}",
                    doc.document_id
                );
            }
        }
    }
}

#[tokio::test]
async fn results_do_not_depend_on_input_order() {
    let forward = pipeline().await.run(corpus()).await.unwrap();

    let mut reversed_docs = corpus();
    reversed_docs.reverse();
    for doc in &mut reversed_docs {
        doc.mentions.reverse();
    }
    let reversed = pipeline().await.run(reversed_docs).await.unwrap();

    assert_eq!(forward.rows(), reversed.rows());
    assert_eq!(forward.report.dedup.collisions, reversed.report.dedup.collisions);
}

#[tokio::test]
async fn phase_two_rerun_is_idempotent() {
    let pipeline = pipeline().await;
    let first = pipeline.run(corpus()).await.unwrap();

    let rerun = pipeline
        .rerun_post_geocode(&first.records, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(rerun.report.dedup.phase2_merges, 0);
    assert_eq!(rerun.rows(), first.rows());
}

#[tokio::test]
async fn document_scope_does_not_merge_across_documents() {
    let mut config = config();
    config.scope = ReconcileScope::Document;
    let pipeline = ReconcilePipeline::new(config, Arc::new(gazetteer()))
        .await
        .unwrap();

    let output = pipeline.run(corpus()).await.unwrap();

    let kaya: Vec<_> = output
        .records
        .iter()
        .filter(|r| r.location_clean() == "kaya")
        .collect();
    assert_eq!(kaya.len(), 2);
    assert!(kaya.iter().all(|r| r.documents().len() == 1));
}

#[tokio::test]
async fn geocoder_failure_degrades_to_unresolved() {
    let geocoder = Arc::new(gazetteer().with_failure("Kaya"));
    let pipeline = ReconcilePipeline::new(config(), geocoder).await.unwrap();

    let output = pipeline.run(corpus()).await.unwrap();

    assert_eq!(output.get("kaya").unwrap().match_quality(), MatchQuality::Unresolved);
    assert_eq!(output.report.geocode.failures, 1);
    assert_eq!(output.get("markoye").unwrap().match_quality(), MatchQuality::Exact);
}

// --- Failure modes ---

#[tokio::test]
async fn missing_vocabulary_fails_before_any_document() {
    let geocoder = Arc::new(gazetteer());
    let result = ReconcilePipeline::new(ReconConfig::default(), geocoder.clone()).await;

    assert!(matches!(result, Err(Error::MissingVocabulary)));
    assert_eq!(geocoder.calls(), 0);
}

#[tokio::test]
async fn cancelled_run_returns_no_records() {
    let pipeline = pipeline().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline.run_with_cancel(corpus(), &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn empty_corpus_is_not_an_error() {
    let output = pipeline()
        .await
        .run(vec![DocumentInput::new("doc9").with_mention(llm("tonalite", 1))])
        .await
        .unwrap();

    assert!(output.records.is_empty());
    assert_eq!(output.report.empty_documents, 1);
    assert_eq!(output.report.documents, 1);
}

#[test]
fn example_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("georecon.example.toml");
    let config = ReconConfig::load(&path).unwrap();

    assert_eq!(config.scope, ReconcileScope::Corpus);
    assert_eq!(config.dedup.rounding_decimals, 2);
    assert_eq!(config.geocoder.query_suffix.as_deref(), Some(", Burkina Faso"));
}
