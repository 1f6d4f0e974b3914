pub mod locks;
pub mod reconciler;
pub mod retention;

pub use locks::ReferenceLocks;
pub use reconciler::{InitiatedPayment, ReconcileError, ReconcileOutcome, Reconciler};
pub use retention::spawn_retention_sweep;
