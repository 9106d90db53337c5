pub mod context;
pub mod error;
pub mod event;
pub mod session;

pub use context::{ActiveRun, CleanupCallback, ExecutionContext, RunRecord};
pub use error::CoreError;
pub use event::{EventEnvelope, EventType, RollbackNotice, CRITICAL_EVENTS};
pub use session::{CoordinatedSession, DbOp, StorageSession};

pub mod telemetry;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the epoch. Used for activity stamps and
/// age checks; event envelopes carry a chrono timestamp instead.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
