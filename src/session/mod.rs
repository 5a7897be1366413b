//! Ephemeral conversion sessions
//!
//! A session ties a short-lived output artifact (and optionally its input) to
//! an unguessable id until it is downloaded once or expires.

pub mod clock;
pub mod reclaim;
pub mod registry;
pub mod sweeper;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use reclaim::{ReclaimReport, reclaim_session, release_artifacts};
pub use registry::SessionRegistry;
pub use sweeper::{DEFAULT_SWEEP_INTERVAL_SECS, SweepResult, Sweeper};
pub use types::Session;
