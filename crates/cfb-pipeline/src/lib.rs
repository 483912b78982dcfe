//! Batch pipelines: the filer/committee rebuild and the proposition
//! reconciler. The set logic lives in pure functions; the store only moves
//! rows in and out.

pub mod filers;
pub mod props;

pub use filers::{load_filers, RebuildSummary};
pub use props::{reconcile_propositions, ReconcileSummary, ResolvedVia};
