/// Coalesces small output chunks into fewer frames.
///
/// Chunks at or below the threshold accumulate until the caller flushes
/// (on its batch timer). A larger chunk flushes whatever is pending and is
/// emitted on its own, so byte order is always preserved.
#[derive(Debug)]
pub struct OutputBatcher {
    threshold: usize,
    pending: Vec<u8>,
}

impl OutputBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            pending: Vec::new(),
        }
    }

    /// Add a chunk. Returns the frames that must be sent right away, in
    /// order; empty when the chunk was buffered.
    pub fn push(&mut self, chunk: Vec<u8>) -> Vec<Vec<u8>> {
        if chunk.len() <= self.threshold {
            self.pending.extend_from_slice(&chunk);
            return Vec::new();
        }
        let mut ready = Vec::with_capacity(2);
        if let Some(batch) = self.flush() {
            ready.push(batch);
        }
        ready.push(chunk);
        ready
    }

    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
