//! Reconciliation worker for uploaded audio.
//!
//! Every cycle lists the upload prefix, drops what local metadata already
//! settles, classifies the rest against the pipeline's database records and
//! runs the pipeline for what is left, with a bounded number of attempts per
//! object tracked in the retry ledger.

pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod metrics;
pub mod outcome;
pub mod owner;
pub mod pipeline;
pub mod poller;
pub mod processor;
pub mod reconcile;
pub mod store;

pub use error::{ProcessingFailure, ReconcileError};
pub use ledger::{AttemptRecord, RetryLedger, SqlRetryLedger};
pub use metrics::ReconcilerMetrics;
pub use owner::OwnerRecord;
pub use pipeline::{CommandPipeline, ProcessingPipeline};
pub use poller::{CycleOutcome, CycleReport, Poller, PollerExit, PollerHandle, PollerState};
pub use store::{AudioStore, ObjectRecord};
