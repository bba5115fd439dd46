//! Resumable fixed-size paging over an ordered list of work items.
//!
//! The cursor never advances on its own. Callers take [`BatchCursor::next_chunk`],
//! commit it, and only then call [`BatchCursor::advance`], so `processed` always
//! matches the last committed checkpoint.

#[derive(Debug, Clone)]
pub struct BatchCursor<'a, T> {
    items: &'a [T],
    chunk_size: usize,
    processed: usize,
}

impl<'a, T> BatchCursor<'a, T> {
    /// A zero chunk size is treated as one.
    pub fn new(items: &'a [T], chunk_size: usize) -> Self {
        Self::resume(items, chunk_size, 0)
    }

    /// Continue from a checkpoint. Items before `processed` are never yielded again.
    pub fn resume(items: &'a [T], chunk_size: usize, processed: usize) -> Self {
        Self {
            items,
            chunk_size: chunk_size.max(1),
            processed: processed.min(items.len()),
        }
    }

    /// The chunk that starts at the current checkpoint.
    pub fn next_chunk(&self) -> Option<&'a [T]> {
        if self.is_exhausted() {
            return None;
        }
        let end = (self.processed + self.chunk_size).min(self.items.len());
        Some(&self.items[self.processed..end])
    }

    /// Record that `count` more items were committed.
    pub fn advance(&mut self, count: usize) {
        self.processed = (self.processed + count).min(self.items.len());
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn remaining(&self) -> usize {
        self.items.len() - self.processed
    }

    pub fn is_exhausted(&self) -> bool {
        self.processed >= self.items.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
