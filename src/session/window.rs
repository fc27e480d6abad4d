//! Sliding replay window over received sequence numbers

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Tracks which sequence numbers have been consumed.
///
/// Sequences more than `size - 1` behind the highest accepted one are
/// rejected outright; inside the window each sequence is accepted once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayWindow {
    size: u64,
    highest: Option<u64>,
    seen: BTreeSet<u64>,
}

impl ReplayWindow {
    /// Empty window of `size` sequences (at least 1)
    pub fn new(size: u64) -> Self {
        ReplayWindow {
            size: size.max(1),
            highest: None,
            seen: BTreeSet::new(),
        }
    }

    /// Highest sequence accepted so far
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Fail with `ReplayDetected` if `sequence` may not be accepted
    pub fn check(&self, sequence: u64) -> EngineResult<()> {
        if let Some(highest) = self.highest {
            if sequence <= highest && highest - sequence >= self.size {
                return Err(EngineError::ReplayDetected);
            }
        }
        if self.seen.contains(&sequence) {
            return Err(EngineError::ReplayDetected);
        }
        Ok(())
    }

    /// Mark `sequence` consumed. Call only after [`ReplayWindow::check`]
    /// passed and the message authenticated.
    pub fn accept(&mut self, sequence: u64) {
        self.seen.insert(sequence);
        let highest = self.highest.map_or(sequence, |h| h.max(sequence));
        self.highest = Some(highest);

        let floor = highest.saturating_sub(self.size - 1);
        self.seen = self.seen.split_off(&floor);
    }
}
