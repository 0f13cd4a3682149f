//! Synthetic payload generation.
//!
//! Payload sizes are drawn from a configurable distribution around the target
//! size, filled with random bytes and base64-encoded so they survive a
//! text-oriented envelope. The drawn size is always at least one byte, no
//! matter how far into the tail a draw lands.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};

/// Shape of the payload size distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeDistribution {
    /// Normal with standard deviation `max(1, target * variance_fraction)`
    Normal { variance_fraction: f64 },
    /// Normal with a fixed standard deviation in bytes
    NormalSigma { sigma: f64 },
    /// Exponential with mean equal to the target size
    Exponential,
    /// Exponential with a fixed rate per byte (mean `1 / rate`)
    ExponentialRate { rate: f64 },
}

impl Default for SizeDistribution {
    fn default() -> Self {
        SizeDistribution::Normal {
            variance_fraction: crate::defaults::SIZE_VARIANCE,
        }
    }
}

/// Sampler built once from a `SizeDistribution`
#[derive(Debug, Clone, Copy)]
enum SizeSampler {
    Normal(Normal<f64>),
    Exponential(Exp<f64>),
}

impl SizeSampler {
    fn new(target_size: usize, distribution: SizeDistribution) -> Result<Self> {
        let mean = target_size as f64;
        match distribution {
            SizeDistribution::Normal { variance_fraction } => {
                let std_dev = normal_std_dev(target_size, variance_fraction);
                Self::normal(mean, std_dev)
            }
            SizeDistribution::NormalSigma { sigma } => Self::normal(mean, sigma),
            SizeDistribution::Exponential => {
                if target_size == 0 {
                    return Err(anyhow!("exponential size distribution needs a non-zero mean"));
                }
                Self::exponential(1.0 / mean)
            }
            SizeDistribution::ExponentialRate { rate } => Self::exponential(rate),
        }
    }

    fn normal(mean: f64, std_dev: f64) -> Result<Self> {
        Normal::new(mean, std_dev)
            .map(SizeSampler::Normal)
            .map_err(|e| anyhow!("invalid normal size distribution: {}", e))
    }

    fn exponential(rate: f64) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(anyhow!("exponential size distribution needs a positive rate, got {}", rate));
        }
        Exp::new(rate)
            .map(SizeSampler::Exponential)
            .map_err(|e| anyhow!("invalid exponential size distribution: {}", e))
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let drawn = match self {
            SizeSampler::Normal(normal) => normal.sample(rng),
            SizeSampler::Exponential(exp) => exp.sample(rng),
        };
        clamp_size(drawn)
    }
}

/// Standard deviation for a normal size draw
fn normal_std_dev(target_size: usize, variance_fraction: f64) -> f64 {
    let scaled = target_size as f64 * variance_fraction;
    if scaled.is_finite() {
        scaled.max(1.0)
    } else {
        1.0
    }
}

/// Truncate a drawn size toward zero and enforce the one-byte floor
fn clamp_size(drawn: f64) -> usize {
    // `as` saturates and maps NaN to 0
    let truncated = drawn as i64;
    truncated.max(1) as usize
}

/// Stateful payload generator used by the publisher
///
/// Owns its RNG so it can move into a task; seed it for reproducible size
/// sequences across runs.
#[derive(Debug)]
pub struct PayloadGenerator {
    target_size: usize,
    sampler: SizeSampler,
    rng: StdRng,
}

impl PayloadGenerator {
    /// Create a generator seeded from the operating system
    pub fn new(target_size: usize, distribution: SizeDistribution) -> Result<Self> {
        Ok(Self {
            target_size,
            sampler: SizeSampler::new(target_size, distribution)?,
            rng: StdRng::from_entropy(),
        })
    }

    /// Create a generator with a fixed seed
    pub fn with_seed(target_size: usize, distribution: SizeDistribution, seed: u64) -> Result<Self> {
        Ok(Self {
            target_size,
            sampler: SizeSampler::new(target_size, distribution)?,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Draw the next raw payload size in bytes (always >= 1)
    pub fn draw_size(&mut self) -> usize {
        self.sampler.sample(&mut self.rng)
    }

    /// Draw a size and return that many random bytes
    pub fn generate_bytes(&mut self) -> Vec<u8> {
        let size = self.draw_size();
        let mut bytes = vec![0u8; size];
        self.rng.fill_bytes(&mut bytes);
        bytes
    }

    /// Draw a size and return that many random bytes, base64-encoded
    pub fn generate(&mut self) -> String {
        STANDARD.encode(self.generate_bytes())
    }
}

/// Generate one base64 payload from a normal size draw
///
/// Mean is `target_size`, standard deviation `max(1, target_size *
/// variance_fraction)`. The drawn size is truncated and clamped to at least
/// one byte before the random bytes are produced. Non-finite or negative
/// fractions fall back to a standard deviation of one byte.
pub fn generate_payload(target_size: usize, variance_fraction: f64) -> String {
    let mut rng = rand::thread_rng();
    let std_dev = normal_std_dev(target_size, variance_fraction);
    let size = match Normal::new(target_size as f64, std_dev) {
        Ok(normal) => clamp_size(normal.sample(&mut rng)),
        Err(_) => target_size.max(1),
    };

    let mut bytes = vec![0u8; size];
    rng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded_len(encoded: &str) -> usize {
        STANDARD.decode(encoded).unwrap().len()
    }

    /// A tiny target with the default variance never yields an empty payload
    #[test]
    fn test_payload_size_floor() {
        for _ in 0..10_000 {
            let payload = generate_payload(1, 0.1);
            assert!(decoded_len(&payload) >= 1);
        }
    }

    #[test]
    fn test_generator_size_floor_for_both_distributions() {
        let mut normal =
            PayloadGenerator::with_seed(1, SizeDistribution::default(), 7).unwrap();
        let mut exponential =
            PayloadGenerator::with_seed(1, SizeDistribution::Exponential, 7).unwrap();

        for _ in 0..10_000 {
            assert!(normal.draw_size() >= 1);
            assert!(exponential.draw_size() >= 1);
        }
    }

    #[test]
    fn test_normal_sizes_center_on_target() {
        let mut generator =
            PayloadGenerator::with_seed(600, SizeDistribution::default(), 42).unwrap();
        let draws = 5_000;
        let total: usize = (0..draws).map(|_| generator.draw_size()).sum();
        let mean = total as f64 / draws as f64;

        // std dev is 60, so the sample mean of 5000 draws sits well within 10
        assert!((mean - 600.0).abs() < 10.0, "mean was {}", mean);
    }

    #[test]
    fn test_zero_variance_is_one_byte_deviation() {
        let mut generator = PayloadGenerator::with_seed(
            600,
            SizeDistribution::Normal {
                variance_fraction: 0.0,
            },
            1,
        )
        .unwrap();

        for _ in 0..1_000 {
            let size = generator.draw_size();
            assert!((590..=610).contains(&size), "size was {}", size);
        }
    }

    #[test]
    fn test_exponential_mean_tracks_target() {
        let mut generator =
            PayloadGenerator::with_seed(200, SizeDistribution::Exponential, 3).unwrap();
        let draws = 20_000;
        let total: usize = (0..draws).map(|_| generator.draw_size()).sum();
        let mean = total as f64 / draws as f64;

        // Truncation shifts the mean down by about half a byte
        assert!((mean - 200.0).abs() < 12.0, "mean was {}", mean);
    }

    #[test]
    fn test_generate_is_base64_of_drawn_size() {
        let mut a = PayloadGenerator::with_seed(64, SizeDistribution::default(), 99).unwrap();
        let mut b = PayloadGenerator::with_seed(64, SizeDistribution::default(), 99).unwrap();

        let expected_size = b.draw_size();
        let payload = a.generate();
        assert_eq!(decoded_len(&payload), expected_size);
    }

    #[test]
    fn test_seeded_generators_repeat() {
        let mut a = PayloadGenerator::with_seed(100, SizeDistribution::default(), 5).unwrap();
        let mut b = PayloadGenerator::with_seed(100, SizeDistribution::default(), 5).unwrap();
        assert_eq!(a.generate(), b.generate());
    }

    #[test]
    fn test_invalid_distributions_are_rejected() {
        assert!(PayloadGenerator::new(0, SizeDistribution::Exponential).is_err());
        assert!(PayloadGenerator::new(
            10,
            SizeDistribution::Normal {
                variance_fraction: f64::NAN
            }
        )
        .is_ok());
    }

    #[test]
    fn test_explicit_sigma_bounds_normal_draws() {
        let mut generator =
            PayloadGenerator::with_seed(500, SizeDistribution::NormalSigma { sigma: 0.0 }, 4)
                .unwrap();
        for _ in 0..100 {
            assert_eq!(generator.draw_size(), 500);
        }

        assert!(PayloadGenerator::new(500, SizeDistribution::NormalSigma { sigma: -1.0 }).is_err());
    }

    #[test]
    fn test_explicit_rate_sets_exponential_mean() {
        // Rate 1/50 gives a mean of 50 bytes whatever the target
        let mut generator = PayloadGenerator::with_seed(
            600,
            SizeDistribution::ExponentialRate { rate: 0.02 },
            8,
        )
        .unwrap();
        let draws = 20_000;
        let total: usize = (0..draws).map(|_| generator.draw_size()).sum();
        let mean = total as f64 / draws as f64;
        assert!((mean - 50.0).abs() < 3.0, "mean was {}", mean);

        assert!(PayloadGenerator::new(600, SizeDistribution::ExponentialRate { rate: 0.0 }).is_err());
    }

    #[test]
    fn test_clamp_size() {
        assert_eq!(clamp_size(-5.0), 1);
        assert_eq!(clamp_size(0.9), 1);
        assert_eq!(clamp_size(f64::NAN), 1);
        assert_eq!(clamp_size(12.7), 12);
    }
}
