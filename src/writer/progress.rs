//! Unique-id bookkeeping for writer progress
//!
//! The writer's `uniqueId` is the id of the last frame it wrote. The detector
//! restarts its array counter at the first step of every configure or seek, so
//! frame ids map onto scan steps through a fixed offset that is recomputed each
//! time the detector is re-armed.

/// Tracks when the writer is done and how its ids map onto completed steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniqueIdTracker {
    offset: i64,
    done_when_reaches: i64,
}

impl UniqueIdTracker {
    /// Detector re-armed at `completed_steps` with its counter starting from `restart_id`.
    pub fn arm(completed_steps: u64, steps_to_do: u64, restart_id: i64) -> Self {
        Self {
            offset: completed_steps as i64 - restart_id,
            done_when_reaches: restart_id + steps_to_do as i64,
        }
    }

    /// Extend the run without re-arming, ids keep counting.
    pub fn extend(&mut self, steps_to_do: u64) {
        self.done_when_reaches += steps_to_do as i64;
    }

    /// Re-arm after a seek; progress stays monotone relative to the new offset.
    pub fn seek(&mut self, completed_steps: u64, steps_to_do: u64, restart_id: i64) {
        *self = Self::arm(completed_steps, steps_to_do, restart_id);
    }

    /// Unique id at which the current run is complete
    pub fn done_when_reaches(&self) -> i64 {
        self.done_when_reaches
    }

    /// Whether `unique_id` covers the whole run
    pub fn is_done(&self, unique_id: i64) -> bool {
        unique_id >= self.done_when_reaches
    }

    /// Completed steps once frame `unique_id` is written.
    pub fn steps_for(&self, unique_id: i64) -> u64 {
        (unique_id + self.offset).max(0) as u64
    }
}
