//! Reassembly of striped steps
//!
//! Stripes of a step may arrive interleaved with stripes of other steps.
//! A step is released once all of its stripes are present; anything older
//! that is still incomplete at that point can never be delivered in order
//! and is discarded. Released steps are therefore strictly increasing.

use super::DataFrame;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct StepAssembler {
    pending: BTreeMap<u64, Vec<Option<Vec<u8>>>>,
    last_released: Option<u64>,
    discarded: u64,
}

impl StepAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incomplete steps given up so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn last_released(&self) -> Option<u64> {
        self.last_released
    }

    /// Add one stripe; returns the step and its bytes once complete
    pub fn push(&mut self, frame: DataFrame) -> Option<(u64, Vec<u8>)> {
        if self.last_released.is_some_and(|last| frame.step <= last) {
            tracing::trace!("Ignoring late stripe {} of step {}", frame.stripe, frame.step);
            return None;
        }
        let stripes = frame.stripes.max(1) as usize;
        let index = frame.stripe as usize;
        if index >= stripes {
            tracing::warn!(
                "Ignoring stripe {} of step {} (only {} stripes)",
                frame.stripe,
                frame.step,
                stripes
            );
            return None;
        }

        let slots = self
            .pending
            .entry(frame.step)
            .or_insert_with(|| vec![None; stripes]);
        if slots.len() != stripes {
            tracing::warn!("Stripe count of step {} changed, ignoring stripe", frame.step);
            return None;
        }
        slots[index] = Some(frame.bytes);
        if slots.iter().any(|s| s.is_none()) {
            return None;
        }

        let step = frame.step;
        let slots = self.pending.remove(&step)?;
        let older: Vec<u64> = self.pending.range(..step).map(|(s, _)| *s).collect();
        for stale in older {
            self.pending.remove(&stale);
            self.discarded += 1;
            tracing::debug!("Discarding incomplete step {} behind step {}", stale, step);
        }
        self.last_released = Some(step);
        Some((step, slots.into_iter().flatten().flatten().collect()))
    }
}
