mod noise;
mod reconciler;

pub use noise::{Classification, NoiseFilter, NoiseMatch};
pub use reconciler::{
    AmbiguousTerm, DocumentReconciliation, ReconciledGroup, Reconciler, SourceConflict,
};
