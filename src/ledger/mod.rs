//! The bet-record ledger: reconciliation of fresh predictions, dispatch to
//! the remote store, votes pulled back from it, and outcome verification.

pub mod pull;
pub mod reconcile;
pub mod remote;
pub mod verify;

pub use pull::{merge_votes, PullReport};
pub use reconcile::{candidate, reconcile, Transition};
pub use remote::{dispatch, dispatch_outcomes, DispatchReport, LedgerSink, RestLedgerSink};
pub use verify::{verify_outcomes, VerifyReport};
