//! Client-side reconciliation for pagesync
//!
//! A transport-agnostic state machine that keeps a local document copy
//! convergent with the relay: it tracks the last known committed version,
//! holds at most one envelope in flight, buffers local steps produced while
//! waiting, and rebases over remote diffs it missed.
//!
//! The machine performs no I/O. Feeding it an event returns the ordered
//! [`Action`]s the embedder must carry out (send a frame, apply steps to the
//! local document, resynchronize).

pub mod rebase;
pub mod sync;

pub use rebase::{IdentityRebaser, StepRebaser};
pub use sync::{Action, SyncClient};
