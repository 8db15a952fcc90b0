/// Block averager: collects samples and appends the mean of every complete
/// block of `block_size` samples to an append-only series.
#[derive(Debug, Clone)]
pub struct AverageBuffer {
    block_size: usize,
    pending: Vec<f64>,
    completed: Vec<f64>,
}

impl AverageBuffer {
    /// `block_size` below 1 is treated as 1.
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            completed: Vec::new(),
        }
    }

    /// Add a sample. Returns the new average if this sample completed a block.
    pub fn add_sample(&mut self, sample: f64) -> Option<f64> {
        self.pending.push(sample);
        if self.pending.len() < self.block_size {
            return None;
        }
        let mean = self.pending.iter().sum::<f64>() / self.pending.len() as f64;
        self.pending.clear();
        self.completed.push(mean);
        Some(mean)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }

    /// Change the block size for subsequent blocks.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size.max(1);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pending(&self) -> &[f64] {
        &self.pending
    }

    pub fn completed(&self) -> &[f64] {
        &self.completed
    }

    pub fn last(&self) -> Option<f64> {
        self.completed.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_one_average_per_block() {
        let mut buf = AverageBuffer::new(3);
        assert_eq!(buf.add_sample(1.0), None);
        assert_eq!(buf.add_sample(2.0), None);
        assert_eq!(buf.add_sample(3.0), Some(2.0));
        assert_eq!(buf.completed(), &[2.0]);
        assert!(buf.pending().is_empty());

        assert_eq!(buf.add_sample(4.0), None);
        assert_eq!(buf.completed(), &[2.0]);
        assert_eq!(buf.pending(), &[4.0]);
    }

    #[test]
    fn block_size_one_passes_samples_through() {
        let mut buf = AverageBuffer::new(0);
        assert_eq!(buf.block_size(), 1);
        assert_eq!(buf.add_sample(-1.5), Some(-1.5));
        assert_eq!(buf.add_sample(2.5), Some(2.5));
        assert_eq!(buf.completed(), &[-1.5, 2.5]);
    }

    #[test]
    fn clear_restarts_both_sequences() {
        let mut buf = AverageBuffer::new(2);
        buf.add_sample(1.0);
        buf.add_sample(3.0);
        buf.add_sample(5.0);
        buf.clear();
        assert!(buf.completed().is_empty());
        assert!(buf.pending().is_empty());
        assert_eq!(buf.last(), None);
    }

    #[test]
    fn resized_blocks_apply_to_next_block() {
        let mut buf = AverageBuffer::new(4);
        buf.set_block_size(2);
        buf.add_sample(1.0);
        assert_eq!(buf.add_sample(2.0), Some(1.5));
    }
}
