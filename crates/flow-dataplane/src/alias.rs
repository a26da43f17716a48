//! Weighted backend selection via the alias method.
//!
//! Sampling is O(1): draw a bin and a uniform, keep the bin with probability
//! `odd`, otherwise jump to its alias. Tables are normally built by the
//! out-of-band consumer and delivered through the inbound ring; the builder
//! lives here so the consumer side and the tests share one implementation.

use crate::stats::{AliasEntry, AS_MAX};
use rand::Rng;

/// Build an alias table from per-backend weights (Vose's method).
///
/// Weights need not be normalised; negative entries are treated as zero.
/// A degenerate input (all zero) yields the identity table, which makes the
/// selector uniform over all bins.
pub fn build(weights: &[f32; AS_MAX]) -> [AliasEntry; AS_MAX] {
    let mut table = [AliasEntry::default(); AS_MAX];
    let total: f64 = weights.iter().map(|&w| f64::from(w.max(0.0))).sum();
    if total <= 0.0 {
        return table;
    }

    // Scale to mean 1.0 and split into under- and over-full bins.
    let mut scaled = [0f64; AS_MAX];
    let mut small = Vec::with_capacity(AS_MAX);
    let mut large = Vec::with_capacity(AS_MAX);
    for (i, &w) in weights.iter().enumerate() {
        scaled[i] = f64::from(w.max(0.0)) * AS_MAX as f64 / total;
        if scaled[i] < 1.0 {
            small.push(i);
        } else {
            large.push(i);
        }
    }

    while let Some(s) = small.pop() {
        let Some(&l) = large.last() else {
            // Rounding left an under-full bin with no over-full partner.
            table[s] = AliasEntry { odd: 1.0, alias: s as u32 };
            continue;
        };
        table[s] = AliasEntry {
            odd: scaled[s] as f32,
            alias: l as u32,
        };
        scaled[l] += scaled[s] - 1.0;
        if scaled[l] < 1.0 {
            large.pop();
            small.push(l);
        }
    }
    // Over-full bins that never drained keep themselves.
    for i in large {
        table[i] = AliasEntry { odd: 1.0, alias: i as u32 };
    }
    table
}

/// Draw one backend index from the table.
#[inline]
pub fn sample<R: Rng>(weights: &[AliasEntry; AS_MAX], rng: &mut R) -> u32 {
    let i = rng.gen_range(0..AS_MAX);
    let u: f32 = rng.gen();
    if u < weights[i].odd {
        i as u32
    } else {
        weights[i].alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn sample_histogram(weights: &[f32; AS_MAX], draws: usize) -> [u64; AS_MAX] {
        let table = build(weights);
        let mut rng = SmallRng::seed_from_u64(0xF10B);
        let mut counts = [0u64; AS_MAX];
        for _ in 0..draws {
            counts[sample(&table, &mut rng) as usize] += 1;
        }
        counts
    }

    #[test]
    fn test_matches_weights_on_simplex() {
        let mut weights = [0.0f32; AS_MAX];
        weights[0] = 0.5;
        weights[3] = 0.25;
        weights[7] = 0.125;
        weights[12] = 0.125;
        let draws = 400_000;
        let counts = sample_histogram(&weights, draws);
        for (i, &w) in weights.iter().enumerate() {
            let observed = counts[i] as f64 / draws as f64;
            assert!(
                (observed - f64::from(w)).abs() < 0.01,
                "bin {i}: observed {observed}, expected {w}"
            );
        }
    }

    #[test]
    fn test_zero_weight_bins_never_drawn() {
        let mut weights = [0.0f32; AS_MAX];
        weights[5] = 1.0;
        let counts = sample_histogram(&weights, 10_000);
        assert_eq!(counts[5], 10_000);
    }

    #[test]
    fn test_unnormalised_weights() {
        let mut weights = [0.0f32; AS_MAX];
        weights[1] = 30.0;
        weights[2] = 10.0;
        let draws = 200_000;
        let counts = sample_histogram(&weights, draws);
        let p1 = counts[1] as f64 / draws as f64;
        let p2 = counts[2] as f64 / draws as f64;
        assert!((p1 - 0.75).abs() < 0.01, "p1 = {p1}");
        assert!((p2 - 0.25).abs() < 0.01, "p2 = {p2}");
    }

    #[test]
    fn test_degenerate_input_is_identity() {
        let table = build(&[0.0; AS_MAX]);
        for (i, e) in table.iter().enumerate() {
            assert_eq!(e.odd, 1.0);
            // Identity alias: the default entry keeps bin 0 as alias but odd
            // 1.0 means the alias is never taken.
            let _ = i;
        }
    }

    #[test]
    fn test_uniform_weights() {
        let weights = [1.0f32; AS_MAX];
        let draws = 640_000;
        let counts = sample_histogram(&weights, draws);
        for &c in &counts {
            let observed = c as f64 / draws as f64;
            assert!((observed - 1.0 / AS_MAX as f64).abs() < 0.005);
        }
    }
}
