// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Synthetic load kernels.
//!
//! A [`LoadGenerator`] produces one bounded burst of busy work per call.
//! Bursts are deliberately short (the controller chunks them to tens of
//! milliseconds) so that cancellation latency stays bounded by one chunk.
//! Working-set size is settled up front through [`LoadGenerator::negotiate`]
//! rather than by catching allocation failures mid-run; a generator that
//! cannot satisfy a requested size reports [`GenError::ResourceExhausted`]
//! and the caller retries smaller.

use std::fmt;
use std::hint::black_box;
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

#[derive(Clone, Debug)]
pub enum GenError {
    ResourceExhausted { requested_bytes: usize },
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenError::ResourceExhausted { requested_bytes } => {
                write!(f, "working set of {} bytes exceeds memory budget", requested_bytes)
            }
        }
    }
}

impl std::error::Error for GenError {}

#[derive(Clone, Copy, Debug, Default)]
pub struct BurstOutcome {
    pub ops: u64,
    pub ran_for: Duration,
    pub mem_bytes: usize,
}

pub trait LoadGenerator: Send {
    /// Adopt a working-set size for subsequent bursts, allocating whatever
    /// buffers that size needs. Returns the size actually adopted. The
    /// meaning of the size is variant-specific (matrix dimension, iteration
    /// block, rays per batch).
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError>;

    /// Run busy work for roughly `budget`, checking the deadline often
    /// enough that overshoot stays small.
    fn burst(&mut self, budget: Duration) -> BurstOutcome;

    /// Drop any held buffers. Called once when the owning controller
    /// drains; bursts must not be issued afterwards.
    fn release(&mut self);

    /// Preferred starting size for [`LoadGenerator::negotiate`].
    fn default_size(&self) -> usize;

    /// Smallest size that still produces meaningful load; the last-resort
    /// fallback after a failed negotiation.
    fn min_size(&self) -> usize;

    /// Variants that ignore the utilization target and run flat out.
    fn flat_out(&self) -> bool {
        false
    }
}

/// Which synthetic kernel to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GenMode {
    Simple,
    Matrix,
    Ray,
    FreqMax,
}

impl FromStr for GenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(GenMode::Simple),
            "matrix" => Ok(GenMode::Matrix),
            "ray" => Ok(GenMode::Ray),
            "freq-max" => Ok(GenMode::FreqMax),
            _ => Err(format!(
                "unknown mode '{}', expected simple|matrix|ray|freq-max",
                s
            )),
        }
    }
}

impl fmt::Display for GenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GenMode::Simple => "simple",
            GenMode::Matrix => "matrix",
            GenMode::Ray => "ray",
            GenMode::FreqMax => "freq-max",
        };
        write!(f, "{}", s)
    }
}

impl GenMode {
    pub fn make(&self, mem_budget_bytes: usize) -> Box<dyn LoadGenerator> {
        match self {
            GenMode::Simple => Box::new(SimpleGen::new()),
            GenMode::Matrix => Box::new(MatrixGen::new(mem_budget_bytes)),
            GenMode::Ray => Box::new(RayTraceGen::new()),
            GenMode::FreqMax => Box::new(FreqMaxGen::new()),
        }
    }
}

/// Fixed-shape arithmetic reduction. No working set to speak of, which
/// makes it the low-risk baseline kernel.
pub struct SimpleGen {
    block_iters: usize,
    acc: u64,
}

impl SimpleGen {
    pub fn new() -> Self {
        Self {
            block_iters: 0,
            acc: 0,
        }
    }

    fn run_block(&mut self) -> u64 {
        let mut acc = self.acc;
        for i in 0..self.block_iters as u64 {
            acc = acc.wrapping_add(black_box(i.wrapping_mul(i)));
        }
        self.acc = acc;
        self.block_iters as u64
    }
}

impl Default for SimpleGen {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadGenerator for SimpleGen {
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError> {
        self.block_iters = size_hint.max(self.min_size());
        Ok(self.block_iters)
    }

    fn burst(&mut self, budget: Duration) -> BurstOutcome {
        let started = Instant::now();
        let mut ops = 0;
        while started.elapsed() < budget {
            ops += self.run_block();
        }
        BurstOutcome {
            ops,
            ran_for: started.elapsed(),
            mem_bytes: 0,
        }
    }

    fn release(&mut self) {}

    fn default_size(&self) -> usize {
        100_000
    }

    fn min_size(&self) -> usize {
        10_000
    }
}

/// Dense matrix multiplication sized to exercise cache and bandwidth.
/// The working set (three square f64 matrices) must fit within the
/// configured memory budget; staying under it is the safety property that
/// keeps repeated runs from tipping the host into OOM.
pub struct MatrixGen {
    mem_budget_bytes: usize,
    dim: usize,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    row: usize,
}

impl MatrixGen {
    pub fn new(mem_budget_bytes: usize) -> Self {
        Self {
            mem_budget_bytes,
            dim: 0,
            a: Vec::new(),
            b: Vec::new(),
            c: Vec::new(),
            row: 0,
        }
    }

    fn working_set_bytes(dim: usize) -> usize {
        3 * dim * dim * std::mem::size_of::<f64>()
    }

    /// Multiply one row of a into c, ~2*dim^2 flops.
    fn run_row(&mut self) -> u64 {
        let dim = self.dim;
        let i = self.row;
        for j in 0..dim {
            let mut sum = 0.0f64;
            for k in 0..dim {
                sum += self.a[i * dim + k] * self.b[k * dim + j];
            }
            self.c[i * dim + j] = black_box(sum);
        }
        self.row = (self.row + 1) % dim;
        (dim * dim) as u64
    }
}

impl LoadGenerator for MatrixGen {
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError> {
        let dim = size_hint.max(self.min_size());
        let bytes = Self::working_set_bytes(dim);
        if bytes > self.mem_budget_bytes {
            return Err(GenError::ResourceExhausted {
                requested_bytes: bytes,
            });
        }

        self.a = (0..dim * dim).map(|i| (i % 97) as f64 * 0.013).collect();
        self.b = (0..dim * dim).map(|i| (i % 89) as f64 * 0.017).collect();
        self.c = vec![0.0; dim * dim];
        self.dim = dim;
        self.row = 0;
        Ok(dim)
    }

    fn burst(&mut self, budget: Duration) -> BurstOutcome {
        let started = Instant::now();
        let mut ops = 0;
        while started.elapsed() < budget {
            ops += self.run_row();
        }
        BurstOutcome {
            ops,
            ran_for: started.elapsed(),
            mem_bytes: Self::working_set_bytes(self.dim),
        }
    }

    fn release(&mut self) {
        self.a = Vec::new();
        self.b = Vec::new();
        self.c = Vec::new();
        self.dim = 0;
        self.row = 0;
    }

    fn default_size(&self) -> usize {
        512
    }

    fn min_size(&self) -> usize {
        64
    }
}

/// Ray-sphere intersection batches over a small static scene, with
/// LCG-generated rays to get divergent, pseudo-random access patterns.
pub struct RayTraceGen {
    rays_per_batch: usize,
    spheres: Vec<[f64; 4]>,
    rng_state: u64,
    hits: u64,
}

impl RayTraceGen {
    const NR_SPHERES: usize = 64;

    pub fn new() -> Self {
        Self {
            rays_per_batch: 0,
            spheres: Vec::new(),
            rng_state: 0x5eed_1234_abcd_ef01,
            hits: 0,
        }
    }

    fn next_f64(&mut self) -> f64 {
        // Numerical Recipes LCG, top 53 bits.
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }

    fn run_batch(&mut self) -> u64 {
        let nr = self.rays_per_batch;
        for _ in 0..nr {
            let ox = self.next_f64() * 10.0 - 5.0;
            let oy = self.next_f64() * 10.0 - 5.0;
            let oz = self.next_f64() * 10.0 - 5.0;
            let dx = self.next_f64() * 2.0 - 1.0;
            let dy = self.next_f64() * 2.0 - 1.0;
            let dz = self.next_f64() * 2.0 - 1.0;
            let idx = (self.rng_state as usize) % self.spheres.len();
            let [cx, cy, cz, r] = self.spheres[idx];

            // Quadratic discriminant test for ray-sphere intersection.
            let lx = ox - cx;
            let ly = oy - cy;
            let lz = oz - cz;
            let a = dx * dx + dy * dy + dz * dz;
            let b = 2.0 * (dx * lx + dy * ly + dz * lz);
            let c = lx * lx + ly * ly + lz * lz - r * r;
            if black_box(b * b - 4.0 * a * c) >= 0.0 {
                self.hits += 1;
            }
        }
        nr as u64
    }
}

impl Default for RayTraceGen {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadGenerator for RayTraceGen {
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError> {
        if self.spheres.is_empty() {
            self.spheres = (0..Self::NR_SPHERES)
                .map(|i| {
                    let f = i as f64;
                    [
                        (f * 0.7).sin() * 4.0,
                        (f * 1.3).cos() * 4.0,
                        (f * 0.4).sin() * 4.0,
                        0.2 + (i % 7) as f64 * 0.1,
                    ]
                })
                .collect();
        }
        self.rays_per_batch = size_hint.max(self.min_size());
        Ok(self.rays_per_batch)
    }

    fn burst(&mut self, budget: Duration) -> BurstOutcome {
        let started = Instant::now();
        let mut ops = 0;
        while started.elapsed() < budget {
            ops += self.run_batch();
        }
        BurstOutcome {
            ops,
            ran_for: started.elapsed(),
            mem_bytes: self.spheres.len() * std::mem::size_of::<[f64; 4]>(),
        }
    }

    fn release(&mut self) {
        self.spheres = Vec::new();
    }

    fn default_size(&self) -> usize {
        4096
    }

    fn min_size(&self) -> usize {
        1024
    }
}

/// Peak-activity kernel: same arithmetic loop as [`SimpleGen`] but flagged
/// flat-out, so the controller pins the duty cycle to 1.0 and never idles.
pub struct FreqMaxGen {
    inner: SimpleGen,
}

impl FreqMaxGen {
    pub fn new() -> Self {
        Self {
            inner: SimpleGen::new(),
        }
    }
}

impl Default for FreqMaxGen {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadGenerator for FreqMaxGen {
    fn negotiate(&mut self, size_hint: usize) -> Result<usize, GenError> {
        self.inner.negotiate(size_hint)
    }

    fn burst(&mut self, budget: Duration) -> BurstOutcome {
        self.inner.burst(budget)
    }

    fn release(&mut self) {
        self.inner.release()
    }

    fn default_size(&self) -> usize {
        self.inner.default_size()
    }

    fn min_size(&self) -> usize {
        self.inner.min_size()
    }

    fn flat_out(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("matrix".parse::<GenMode>().unwrap(), GenMode::Matrix);
        assert_eq!("freq-max".parse::<GenMode>().unwrap(), GenMode::FreqMax);
        assert!("gpu".parse::<GenMode>().is_err());
    }

    #[test]
    fn test_matrix_negotiate_respects_budget() {
        // 3 * 64 * 64 * 8 = 96 KiB, so a 64 KiB budget must refuse even the
        // minimum size while 1 MiB accepts it.
        let mut gen = MatrixGen::new(64 * 1024);
        assert!(matches!(
            gen.negotiate(64),
            Err(GenError::ResourceExhausted { .. })
        ));

        let mut gen = MatrixGen::new(1024 * 1024);
        assert_eq!(gen.negotiate(64).unwrap(), 64);
        assert_eq!(gen.negotiate(10).unwrap(), 64); // clamped up to min
        assert!(gen.negotiate(1024).is_err()); // 24 MiB > 1 MiB
    }

    #[test]
    fn test_bursts_complete_near_budget() {
        for mut gen in [
            Box::new(SimpleGen::new()) as Box<dyn LoadGenerator>,
            Box::new(MatrixGen::new(64 * 1024 * 1024)),
            Box::new(RayTraceGen::new()),
            Box::new(FreqMaxGen::new()),
        ] {
            gen.negotiate(gen.min_size()).unwrap();
            let budget = Duration::from_millis(10);
            let outcome = gen.burst(budget);
            assert!(outcome.ops > 0);
            assert!(outcome.ran_for >= budget);
            // Overshoot bounded by one inner block.
            assert!(outcome.ran_for < budget + Duration::from_millis(100));
            gen.release();
        }
    }

    #[test]
    fn test_flat_out_flag() {
        assert!(!SimpleGen::new().flat_out());
        assert!(FreqMaxGen::new().flat_out());
    }

    #[test]
    fn test_matrix_release_drops_buffers() {
        let mut gen = MatrixGen::new(64 * 1024 * 1024);
        gen.negotiate(128).unwrap();
        assert!(!gen.a.is_empty());
        gen.release();
        assert!(gen.a.is_empty() && gen.b.is_empty() && gen.c.is_empty());
    }
}
