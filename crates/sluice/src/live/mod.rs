//! Live continuation: how a session finds fragments the manifest it opened
//! with did not list yet.

pub mod bump;
pub mod reget;
pub mod sync;

pub use reget::Reconcile;
pub use sync::{SyncBlock, SyncSnapshot};
