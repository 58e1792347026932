use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::candidate::{CandidateAdapter, DocumentInput, MentionSource, Rejection};
use crate::config::{ReconConfig, ReconcileScope};
use crate::dedup::{CanonicalLocation, DedupReport, Deduplicator};
use crate::error::{Error, Result};
use crate::geocode::{GeocodeStats, Geocoder, GeocodingService};
use crate::output::LocationRow;
use crate::provenance::ProvenanceStore;
use crate::reconcile::{AmbiguousTerm, DocumentReconciliation, Reconciler, SourceConflict};

/// Audit trail of one run, returned as data.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: ReconcileScope,
    pub documents: usize,
    pub empty_documents: usize,
    pub mentions_in: usize,
    pub candidates_geographic: usize,
    pub rejections: Vec<Rejection>,
    pub ambiguous: Vec<AmbiguousTerm>,
    pub source_conflicts: Vec<SourceConflict>,
    pub dedup: DedupReport,
    pub geocode: GeocodeStats,
}

impl RunReport {
    fn new(run_id: Uuid, scope: ReconcileScope, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            scope,
            documents: 0,
            empty_documents: 0,
            mentions_in: 0,
            candidates_geographic: 0,
            rejections: Vec::new(),
            ambiguous: Vec::new(),
            source_conflicts: Vec::new(),
            dedup: DedupReport::default(),
            geocode: GeocodeStats::default(),
        }
    }

    pub fn noise_rejections(&self) -> usize {
        self.rejections.iter().filter(|r| r.reason.is_noise()).count()
    }

    pub fn malformed_rejections(&self) -> usize {
        self.rejections.len() - self.noise_rejections()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Finalized records of a run with the provenance index and audit report.
#[derive(Debug)]
pub struct RunOutput {
    pub records: Vec<CanonicalLocation>,
    pub provenance: ProvenanceStore,
    pub report: RunReport,
}

impl RunOutput {
    #[must_use]
    pub fn rows(&self) -> Vec<LocationRow> {
        self.records.iter().map(LocationRow::from).collect()
    }

    pub fn get(&self, location_clean: &str) -> Option<&CanonicalLocation> {
        self.records
            .iter()
            .find(|r| r.location_clean() == location_clean)
    }
}

/// Drives adaptation, reconciliation, both dedup phases and geocoding.
///
/// Construction validates the configuration and checks the geocoder is
/// reachable, so every fatal condition surfaces before any document is
/// touched. A run either returns all of its records or none.
pub struct ReconcilePipeline {
    config: ReconConfig,
    reconciler: Arc<Reconciler>,
    geocoding: Arc<GeocodingService>,
}

impl ReconcilePipeline {
    pub async fn new(config: ReconConfig, geocoder: Arc<dyn Geocoder>) -> Result<Self> {
        config.validate()?;
        let reconciler = Reconciler::from_config(&config.noise)?;
        let geocoding = GeocodingService::from_config(geocoder, &config);
        geocoding.check_reachable().await?;

        tracing::info!(
            scope = config.scope.as_str(),
            rounding = config.dedup.rounding_decimals,
            "Reconciliation pipeline ready"
        );

        Ok(Self {
            config,
            reconciler: Arc::new(reconciler),
            geocoding: Arc::new(geocoding),
        })
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn geocoding(&self) -> &GeocodingService {
        &self.geocoding
    }

    pub async fn run(&self, documents: Vec<DocumentInput>) -> Result<RunOutput> {
        self.run_with_cancel(documents, &CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        documents: Vec<DocumentInput>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let span = tracing::info_span!("reconcile_run", %run_id);

        async {
            let mut tasks = JoinSet::new();
            for document in documents {
                let reconciler = Arc::clone(&self.reconciler);
                tasks.spawn(async move { reconciler.reconcile(CandidateAdapter::adapt(document)) });
            }
            let reconciled = join_documents(tasks, cancel).await?;
            self.finish(RunReport::new(run_id, self.config.scope, started_at), reconciled, cancel)
                .await
        }
        .instrument(span)
        .await
    }

    /// Like [`ReconcilePipeline::run_with_cancel`], but pulls each
    /// document's mentions from the given extractors.
    pub async fn run_sources(
        &self,
        document_ids: Vec<String>,
        sources: Arc<Vec<Box<dyn MentionSource>>>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let span = tracing::info_span!("reconcile_run", %run_id);

        async {
            let mut tasks = JoinSet::new();
            for document_id in document_ids {
                let reconciler = Arc::clone(&self.reconciler);
                let sources = Arc::clone(&sources);
                tasks.spawn(async move {
                    let adapted = CandidateAdapter::collect(&document_id, &sources).await;
                    reconciler.reconcile(adapted)
                });
            }
            let reconciled = join_documents(tasks, cancel).await?;
            self.finish(RunReport::new(run_id, self.config.scope, started_at), reconciled, cancel)
                .await
        }
        .instrument(span)
        .await
    }

    async fn finish(
        &self,
        mut report: RunReport,
        reconciled: Vec<DocumentReconciliation>,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let scope = report.scope;
        let stats_before = self.geocoding.stats();

        let mut arenas = Vec::new();
        if scope == ReconcileScope::Corpus {
            arenas.push(Deduplicator::new(&self.config.dedup));
        }

        for doc in reconciled {
            report.documents += 1;
            report.mentions_in += doc.mentions_in;
            report.candidates_geographic += doc.geographic_candidates();
            if doc.is_empty() {
                tracing::debug!("No geographic candidates in {}", doc.document_id);
                report.empty_documents += 1;
            }
            report.rejections.extend(doc.rejections);
            report.ambiguous.extend(doc.ambiguous);
            report.source_conflicts.extend(doc.source_conflicts);

            if scope == ReconcileScope::Document {
                arenas.push(Deduplicator::new(&self.config.dedup));
            }
            if let Some(arena) = arenas.last_mut() {
                arena.merge_pre_geocode(doc.groups)?;
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (records, provenance, dedup) = self.geocode_and_finalize(arenas, cancel).await?;

        report.dedup = dedup;
        report.geocode = self.geocoding.stats().since(&stats_before);
        report.finished_at = Utc::now();

        tracing::info!(
            documents = report.documents,
            records = records.len(),
            rejected = report.rejections.len(),
            ambiguous = report.ambiguous.len(),
            "Reconciliation run complete in {}ms",
            report.duration_ms()
        );

        Ok(RunOutput {
            records,
            provenance,
            report,
        })
    }

    async fn geocode_and_finalize(
        &self,
        mut arenas: Vec<Deduplicator>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<CanonicalLocation>, ProvenanceStore, DedupReport)> {
        let pending = arenas.iter().flat_map(Deduplicator::pending_geocode);
        let results = self.geocoding.geocode_all(pending, cancel).await?;

        for arena in &mut arenas {
            arena.apply_geocodes(&results)?;
            arena.merge_post_geocode()?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut records = Vec::new();
        let mut provenance = ProvenanceStore::new();
        let mut dedup = DedupReport::default();
        for arena in arenas {
            let (finalized, report, store) = arena.finalize();
            records.extend(finalized);
            dedup.merge(report);
            provenance.extend(store);
        }

        Ok((records, provenance, dedup))
    }

    /// Retry unresolved records against this pipeline's geocoder and run
    /// phase 2 again, e.g. after the geocoding service was upgraded. Phase 1
    /// is not repeated and the input records are left as they are.
    pub async fn rerun_post_geocode(
        &self,
        records: &[CanonicalLocation],
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let run_id = Uuid::now_v7();
        let span = tracing::info_span!("reconcile_rerun", %run_id);

        async {
            let scope = self.config.scope;
            let mut report = RunReport::new(run_id, scope, Utc::now());
            let stats_before = self.geocoding.stats();

            let mut arenas: Vec<Deduplicator> = match scope {
                ReconcileScope::Corpus => vec![Deduplicator::reopen(records, &self.config.dedup)],
                ReconcileScope::Document => {
                    let mut by_document: BTreeMap<&str, Vec<CanonicalLocation>> = BTreeMap::new();
                    for record in records {
                        let document = record.documents().into_iter().next().unwrap_or_default();
                        by_document.entry(document).or_default().push(record.clone());
                    }
                    by_document
                        .values()
                        .map(|group| Deduplicator::reopen(group, &self.config.dedup))
                        .collect()
                }
            };
            report.documents = arenas.len();

            for arena in &mut arenas {
                arena.reset_unresolved();
            }

            let (records, provenance, dedup) = self.geocode_and_finalize(arenas, cancel).await?;
            report.dedup = dedup;
            report.geocode = self.geocoding.stats().since(&stats_before);
            report.finished_at = Utc::now();

            tracing::info!(
                records = records.len(),
                merges = report.dedup.phase2_merges,
                "Post-geocode rerun complete"
            );

            Ok(RunOutput {
                records,
                provenance,
                report,
            })
        }
        .instrument(span)
        .await
    }
}

/// Waits for every per-document task. Results are ordered by document id so
/// the merge stage sees the same order whatever finished first.
async fn join_documents(
    mut tasks: JoinSet<DocumentReconciliation>,
    cancel: &CancellationToken,
) -> Result<Vec<DocumentReconciliation>> {
    let mut reconciled = Vec::with_capacity(tasks.len());
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tasks.abort_all();
                tracing::info!("Run cancelled; discarding {} reconciled documents", reconciled.len());
                return Err(Error::Cancelled);
            }
            joined = tasks.join_next() => match joined {
                Some(outcome) => reconciled.push(outcome?),
                None => break,
            },
        }
    }

    reconciled.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok(reconciled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{ExtractorSource, RawMention, SourceError, SourceResult};
    use crate::geocode::{GeocodeError, GeocodeMatch, LookupResult, MatchQuality, StaticGeocoder};

    fn config() -> ReconConfig {
        let mut config = ReconConfig::default();
        config.noise.excluded_terms = vec!["granite".into(), "shear zone".into()];
        config
    }

    fn geocoder() -> Arc<StaticGeocoder> {
        Arc::new(
            StaticGeocoder::new()
                .with_place("Kaya", GeocodeMatch::new(13.0917, -1.0844, "town"))
                .with_place("Dori", GeocodeMatch::new(14.0354, -0.0345, "town")),
        )
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl Geocoder for Unreachable {
        async fn resolve(&self, _query: &str) -> LookupResult<Option<GeocodeMatch>> {
            Ok(None)
        }

        async fn health_check(&self) -> LookupResult<()> {
            Err(GeocodeError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_startup_fails_on_unreachable_geocoder() {
        let result = ReconcilePipeline::new(config(), Arc::new(Unreachable)).await;
        assert!(matches!(result, Err(Error::GeocoderUnreachable(_))));
    }

    #[tokio::test]
    async fn test_startup_fails_on_empty_vocabulary() {
        let result = ReconcilePipeline::new(ReconConfig::default(), geocoder()).await;
        assert!(matches!(result, Err(Error::MissingVocabulary)));
    }

    #[tokio::test]
    async fn test_run_reports_counts() {
        let pipeline = ReconcilePipeline::new(config(), geocoder()).await.unwrap();
        let docs = vec![
            DocumentInput::new("doc2")
                .with_mention(RawMention::new("Dori", ExtractorSource::Llm, &[4]))
                .with_mention(RawMention::new("granite", ExtractorSource::Llm, &[4])),
            DocumentInput::new("doc1")
                .with_mention(RawMention::new("Kaya", ExtractorSource::Llm, &[1]))
                .with_mention(RawMention::new("", ExtractorSource::Llm, &[1])),
        ];

        let output = pipeline.run(docs).await.unwrap();

        assert_eq!(output.records.len(), 2);
        assert_eq!(output.report.documents, 2);
        assert_eq!(output.report.mentions_in, 4);
        assert_eq!(output.report.candidates_geographic, 2);
        assert_eq!(output.report.noise_rejections(), 1);
        assert_eq!(output.report.malformed_rejections(), 1);
        assert_eq!(output.report.geocode.service_calls, 2);
        assert!(output.records.iter().all(CanonicalLocation::is_frozen));
        assert_eq!(output.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_document_scope_keeps_documents_apart() {
        let mut config = config();
        config.scope = ReconcileScope::Document;
        let geocoder = geocoder();
        let pipeline = ReconcilePipeline::new(config, geocoder.clone()).await.unwrap();
        let docs = vec![
            DocumentInput::new("doc1").with_mention(RawMention::new("Kaya", ExtractorSource::Llm, &[1])),
            DocumentInput::new("doc2").with_mention(RawMention::new("Kaya", ExtractorSource::Llm, &[8])),
        ];

        let output = pipeline.run(docs).await.unwrap();

        assert_eq!(output.records.len(), 2);
        assert_eq!(output.provenance.documents("kaya").len(), 2);
        assert_eq!(geocoder.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_emits_nothing() {
        let pipeline = ReconcilePipeline::new(config(), geocoder()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline
            .run_with_cancel(
                vec![DocumentInput::new("doc1")
                    .with_mention(RawMention::new("Kaya", ExtractorSource::Llm, &[1]))],
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    struct FixedSource(ExtractorSource, &'static str);

    #[async_trait::async_trait]
    impl MentionSource for FixedSource {
        fn source(&self) -> ExtractorSource {
            self.0.clone()
        }

        async fn mentions(&self, _document_id: &str) -> SourceResult<Vec<RawMention>> {
            if self.1.is_empty() {
                return Err(SourceError::Unavailable("model offline".into()));
            }
            Ok(vec![RawMention {
                raw_text: Some(self.1.into()),
                page_numbers: vec![2],
                ..RawMention::default()
            }])
        }
    }

    #[tokio::test]
    async fn test_run_sources_survives_failing_extractor() {
        let pipeline = ReconcilePipeline::new(config(), geocoder()).await.unwrap();
        let sources: Vec<Box<dyn MentionSource>> = vec![
            Box::new(FixedSource(ExtractorSource::Llm, "Kaya")),
            Box::new(FixedSource(ExtractorSource::rule_based("spacy"), "Kaya")),
            Box::new(FixedSource(ExtractorSource::Other("ocr".into()), "")),
        ];

        let output = pipeline
            .run_sources(vec!["doc1".into()], Arc::new(sources), &CancellationToken::new())
            .await
            .unwrap();

        let kaya = output.get("kaya").unwrap();
        assert!(kaya.is_corroborated());
        assert_eq!(kaya.match_quality(), MatchQuality::Exact);
    }

    struct RecoveringGeocoder {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Geocoder for RecoveringGeocoder {
        async fn resolve(&self, _query: &str) -> LookupResult<Option<GeocodeMatch>> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                return Err(GeocodeError::Status(503));
            }
            Ok(Some(GeocodeMatch::new(13.0917, -1.0844, "town")))
        }
    }

    #[tokio::test]
    async fn test_rerun_retries_transient_failure_on_same_pipeline() {
        let geocoder = Arc::new(RecoveringGeocoder {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let pipeline = ReconcilePipeline::new(config(), geocoder.clone()).await.unwrap();
        let docs = vec![DocumentInput::new("doc1")
            .with_mention(RawMention::new("Kaya", ExtractorSource::Llm, &[1]))];

        let first = pipeline.run(docs).await.unwrap();
        assert_eq!(first.get("kaya").unwrap().match_quality(), MatchQuality::Unresolved);
        assert_eq!(first.report.geocode.failures, 1);

        let rerun = pipeline
            .rerun_post_geocode(&first.records, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rerun.get("kaya").unwrap().match_quality(), MatchQuality::Exact);
        assert_eq!(rerun.report.geocode.service_calls, 1);
        assert_eq!(rerun.report.geocode.cache_hits, 0);
        assert_eq!(geocoder.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rerun_post_geocode_with_upgraded_geocoder() {
        let before = Arc::new(StaticGeocoder::new());
        let pipeline = ReconcilePipeline::new(config(), before).await.unwrap();
        let docs = vec![DocumentInput::new("doc1")
            .with_mention(RawMention::new("Kaya", ExtractorSource::Llm, &[1]))
            .with_mention(RawMention::new("Kaya Town", ExtractorSource::Llm, &[2]))];
        let first = pipeline.run(docs).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(first
            .records
            .iter()
            .all(|r| r.match_quality() == MatchQuality::Unresolved));

        let upgraded_geocoder = Arc::new(
            StaticGeocoder::new()
                .with_place("Kaya", GeocodeMatch::new(13.0917, -1.0844, "town"))
                .with_place("Kaya Town", GeocodeMatch::new(13.0921, -1.0839, "town")),
        );
        let upgraded = ReconcilePipeline::new(config(), upgraded_geocoder).await.unwrap();

        let rerun = upgraded
            .rerun_post_geocode(&first.records, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rerun.records.len(), 1);
        assert_eq!(rerun.report.dedup.phase2_merges, 1);
        assert_eq!(rerun.records[0].provenance().len(), 2);
        assert!(first.records.iter().all(CanonicalLocation::is_frozen));
    }
}
