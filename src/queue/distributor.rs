//! Round-robin consumer selection for a single queue binding.

/// Picks the consumer that receives the next message.
///
/// The cursor points at the consumer that is offered the next message.
/// Selection scans forward from the cursor (wrapping) and skips consumers
/// that are not ready, so ready consumers are served in arrival order and
/// no consumer is picked twice while another ready one waits its turn.
#[derive(Debug, Default, Clone)]
pub struct Distributor {
    cursor: usize,
}

impl Distributor {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Index of the consumer that would be tried first
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Select the next ready consumer and advance the cursor past it.
    ///
    /// Returns `None` when no candidate is ready; the cursor is left as is.
    pub fn select<T, F>(&mut self, candidates: &[T], is_ready: F) -> Option<usize>
    where
        F: Fn(&T) -> bool,
    {
        let len = candidates.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if is_ready(&candidates[idx]) {
                self.cursor = (idx + 1) % len;
                return Some(idx);
            }
        }
        None
    }

    /// Keep the rotation stable when the candidate at `index` is removed
    pub fn on_removed(&mut self, index: usize, remaining: usize) {
        if index < self.cursor {
            self.cursor -= 1;
        }
        if remaining == 0 || self.cursor >= remaining {
            self.cursor = 0;
        }
    }
}
