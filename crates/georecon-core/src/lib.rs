#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::option_if_let_else)]

pub mod candidate;
pub mod config;
pub mod dedup;
pub mod error;
pub mod geocode;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod provenance;
pub mod reconcile;

pub use candidate::{
    AttributeKind, CandidateAdapter, DocumentInput, ExtractorSource, LocationCandidate,
    MentionSource, QuantAttribute, RawMention, Rejection, RejectionReason,
};
pub use config::{
    ConflictPolicy, DedupConfig, GeocoderConfig, NoiseConfig, ReconConfig, ReconcileScope,
};
pub use dedup::{CanonicalLocation, DedupReport, Deduplicator, KeyCollision, MergePhase};
pub use error::{Error, Result};
pub use geocode::{
    GeocodeMatch, GeocodeResult, Geocoder, GeocodingService, MatchQuality, NominatimGeocoder,
    RoundedLatLon, StaticGeocoder,
};
pub use normalize::normalize;
pub use output::{LocationRow, RenderStyle};
pub use pipeline::{ReconcilePipeline, RunOutput, RunReport};
pub use provenance::{ProvenanceEntry, ProvenanceStore};
pub use reconcile::{ReconciledGroup, Reconciler};
