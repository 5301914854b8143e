//! Two-resolution latency histogram.
//!
//! Fine range: 0..10 ms in 1 µs buckets. Coarse range: 10 ms..1 s in
//! 100 µs buckets. Samples above 1 s land in an overflow counter.
//! Invariant: `count == sum(slots) + overflow`.

pub const FINE_SLOTS: usize = 10_000;
pub const COARSE_SLOTS: usize = 9_900;
pub const TOTAL_SLOTS: usize = FINE_SLOTS + COARSE_SLOTS;
pub const FINE_MAX_US: f64 = 10_000.0;
pub const COARSE_STEP_US: f64 = 100.0;

#[derive(Clone)]
pub struct Histogram {
    slots: Box<[u64; TOTAL_SLOTS]>,
    over: u64,
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

fn us_to_slot(us: f64) -> Option<usize> {
    if us < 0.0 {
        return Some(0);
    }
    if us < FINE_MAX_US {
        return Some(us as usize);
    }
    let coarse = ((us - FINE_MAX_US) / COARSE_STEP_US) as usize;
    if coarse >= COARSE_SLOTS {
        return None; // over 1s
    }
    Some(FINE_SLOTS + coarse)
}

fn slot_to_us(slot: usize) -> f64 {
    if slot < FINE_SLOTS {
        slot as f64
    } else {
        FINE_MAX_US + (slot - FINE_SLOTS) as f64 * COARSE_STEP_US
    }
}

impl Histogram {
    pub fn new() -> Histogram {
        Histogram {
            slots: Box::new([0; TOTAL_SLOTS]),
            over: 0,
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: 0.0,
        }
    }

    pub fn add(&mut self, us: f64) {
        self.count += 1;
        self.sum += us;
        self.sum_sq += us * us;
        if us < self.min {
            self.min = us;
        }
        if us > self.max {
            self.max = us;
        }
        match us_to_slot(us) {
            Some(slot) => self.slots[slot] += 1,
            None => self.over += 1,
        }
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (dst, src) in self.slots.iter_mut().zip(other.slots.iter()) {
            *dst += *src;
        }
        self.over += other.over;
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }

    /// Lower edge of the first bucket whose cumulative count exceeds
    /// `floor(count * p / 100)`; `max` when the scan exhausts the slots.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = (self.count as f64 * p / 100.0) as u64;
        let mut cumulative = 0u64;
        for (slot, &n) in self.slots.iter().enumerate() {
            cumulative += n;
            if cumulative > target {
                return slot_to_us(slot);
            }
        }
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Population standard deviation, guarded against negative variance
    /// from floating-point round-off.
    pub fn stdev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self.sum_sq / self.count as f64 - mean * mean;
        if variance > 0.0 { variance.sqrt() } else { 0.0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    #[cfg(test)]
    fn bucketed(&self) -> u64 {
        self.slots.iter().sum::<u64>() + self.over
    }
}
