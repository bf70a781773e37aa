//! Timestamped sample FIFO shared by the radio drivers

use num_complex::Complex32;
use std::collections::VecDeque;

/// What happened to a block written into the FIFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriteReport {
    /// Samples discarded because their time was already covered
    pub late: usize,
    /// Zero samples inserted to fill a gap before the block
    pub padded: usize,
    /// Oldest samples dropped to stay within capacity
    pub overflow: usize,
}

/// Contiguous run of samples starting at a known timestamp
pub(crate) struct TimedFifo {
    samples: VecDeque<Complex32>,
    start_ts: u64,
    capacity: usize,
}

impl TimedFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1 << 20)),
            start_ts: 0,
            capacity,
        }
    }

    /// Empty the FIFO and place its read position at `ts`
    pub fn reset(&mut self, ts: u64) {
        self.samples.clear();
        self.start_ts = ts;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Timestamp of the oldest queued sample
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Timestamp following the newest queued sample
    pub fn end_ts(&self) -> u64 {
        self.start_ts + self.samples.len() as u64
    }

    /// Append `block` at `ts`, trimming overlap and zero-filling gaps
    pub fn write(&mut self, ts: u64, block: &[Complex32]) -> WriteReport {
        let mut report = WriteReport::default();
        let end = self.end_ts();
        let block_end = ts + block.len() as u64;

        if block_end <= end {
            report.late = block.len();
            return report;
        }

        let block = if ts < end {
            let skip = (end - ts) as usize;
            report.late = skip;
            &block[skip..]
        } else {
            let gap = (ts - end) as usize;
            if gap > self.capacity {
                self.reset(ts);
            } else {
                self.samples
                    .extend(std::iter::repeat(Complex32::new(0.0, 0.0)).take(gap));
            }
            report.padded = gap;
            block
        };
        self.samples.extend(block.iter().copied());

        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(..excess);
            self.start_ts += excess as u64;
            report.overflow = excess;
        }
        report
    }

    /// Pop up to `out.len()` samples from the front, returns how many
    pub fn read(&mut self, out: &mut [Complex32]) -> usize {
        let n = out.len().min(self.samples.len());
        for (dst, src) in out.iter_mut().zip(self.samples.drain(..n)) {
            *dst = src;
        }
        self.start_ts += n as u64;
        n
    }

    /// Fill `out` with the samples of `[ts, ts + out.len())`.
    ///
    /// Samples older than `ts` are discarded, missing ones read as zero.
    /// Returns the number of samples actually taken from the FIFO.
    pub fn read_at(&mut self, ts: u64, out: &mut [Complex32]) -> usize {
        out.fill(Complex32::new(0.0, 0.0));
        let end = ts + out.len() as u64;
        if ts >= self.end_ts() {
            self.reset(end);
            return 0;
        }
        if ts > self.start_ts {
            let stale = (ts - self.start_ts) as usize;
            self.samples.drain(..stale);
            self.start_ts = ts;
        }
        let lead = (self.start_ts - ts) as usize;
        if lead >= out.len() {
            return 0;
        }
        let taken = self.read(&mut out[lead..]);
        if self.samples.is_empty() {
            self.start_ts = self.start_ts.max(end);
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, n: usize) -> Vec<Complex32> {
        (start..start + n).map(|i| Complex32::new(i as f32, 0.0)).collect()
    }

    #[test]
    fn test_write_contiguous_and_read() {
        let mut fifo = TimedFifo::new(100);
        fifo.reset(10);
        assert_eq!(fifo.write(10, &ramp(0, 5)), WriteReport::default());
        assert_eq!(fifo.write(15, &ramp(5, 5)), WriteReport::default());
        let mut out = vec![Complex32::new(0.0, 0.0); 7];
        assert_eq!(fifo.read(&mut out), 7);
        assert_eq!(out, ramp(0, 7));
        assert_eq!(fifo.start_ts(), 17);
        assert_eq!(fifo.len(), 3);
    }

    #[test]
    fn test_late_and_gap() {
        let mut fifo = TimedFifo::new(100);
        fifo.write(0, &ramp(0, 10));
        assert_eq!(fifo.write(2, &ramp(0, 5)).late, 5);
        let report = fifo.write(8, &ramp(0, 4));
        assert_eq!(report.late, 2);
        assert_eq!(fifo.end_ts(), 12);
        let report = fifo.write(20, &ramp(0, 4));
        assert_eq!(report.padded, 8);
        assert_eq!(fifo.end_ts(), 24);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut fifo = TimedFifo::new(8);
        let report = fifo.write(0, &ramp(0, 12));
        assert_eq!(report.overflow, 4);
        assert_eq!(fifo.start_ts(), 4);
        assert_eq!(fifo.len(), 8);
    }

    #[test]
    fn test_read_at_aligns_to_timestamp() {
        let mut fifo = TimedFifo::new(100);
        fifo.reset(10);
        fifo.write(10, &ramp(10, 10));
        let mut out = vec![Complex32::new(0.0, 0.0); 6];
        // Starts before the queued data: leading zeros
        assert_eq!(fifo.read_at(6, &mut out), 2);
        assert_eq!(out[4], Complex32::new(10.0, 0.0));
        assert_eq!(out[0], Complex32::new(0.0, 0.0));
        // Skips stale samples
        assert_eq!(fifo.read_at(15, &mut out), 5);
        assert_eq!(out[0], Complex32::new(15.0, 0.0));
        assert_eq!(out[5], Complex32::new(0.0, 0.0));
    }
}
