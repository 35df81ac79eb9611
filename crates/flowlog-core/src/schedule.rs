//! Snapshot and upload scheduling
//!
//! [`ScheduleEvaluator::evaluate`] is a pure function of the current minute
//! and the previous [`ScheduleState`]. Both triggers are edge-guarded on the
//! minute they last fired, so a control loop that ticks several times within
//! one minute (or restarts inside it, since the state is persisted) acts at
//! most once per minute.
//!
//! The upload trigger is an exact match on the unit's slot. A tick that
//! misses the slot minute entirely does not upload until the next day.

use serde::{Deserialize, Serialize};

use crate::config::{Config, SnapshotPredicate, UnitId, UploadPredicate};
use crate::time::DateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_snapshot: Option<DateTime>,
    pub last_upload_attempt: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub snapshot: bool,
    pub upload: bool,
    /// `now` is earlier than a minute recorded in the previous state
    pub clock_regressed: bool,
    pub next: ScheduleState,
}

#[derive(Clone, Copy)]
pub struct ScheduleEvaluator {
    unit: UnitId,
    snapshot_due: SnapshotPredicate,
    upload_due: UploadPredicate,
}

impl ScheduleEvaluator {
    pub fn new(config: &Config<'_>) -> Self {
        Self {
            unit: config.unit_id,
            snapshot_due: config.snapshot_due,
            upload_due: config.upload_due,
        }
    }

    pub fn evaluate(&self, now: &DateTime, state: &ScheduleState) -> ScheduleDecision {
        let snapshot = (self.snapshot_due)(now) && state.last_snapshot != Some(*now);
        let upload = (self.upload_due)(now, self.unit) && state.last_upload_attempt != Some(*now);

        // A clock stepped backwards (e.g. by network time) is accepted as the
        // new reference; the flag lets the caller record it.
        let clock_regressed = state.last_snapshot.is_some_and(|t| *now < t)
            || state.last_upload_attempt.is_some_and(|t| *now < t);

        let mut next = *state;
        if snapshot {
            next.last_snapshot = Some(*now);
        }
        if upload {
            next.last_upload_attempt = Some(*now);
        }

        ScheduleDecision {
            snapshot,
            upload,
            clock_regressed,
            next,
        }
    }
}
