//! Reservoir samplers for the telemetry metric families.
//!
//! Each family is a fixed array of `RESERVOIR_BINS` time-value pairs. An
//! update overwrites one bin chosen uniformly at random — lossy by design;
//! the statistical estimators live in the out-of-band consumer. All records
//! are `#[repr(C)]` because the reservoir blocks are part of the shared-memory
//! wire layout.

use rand::Rng;

/// Number of bins per metric family.
pub const RESERVOIR_BINS: usize = 32;

/// Time-value pair, float value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TvPairF {
    pub t: f32,
    pub v: f32,
}

/// Time-value pair, unsigned value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TvPairU {
    pub t: f32,
    pub v: u32,
}

/// Time-value pair, signed value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TvPairI {
    pub t: f32,
    pub v: i32,
}

/// Per-backend reservoir block. Field order is part of the wire contract.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AsReservoir {
    /// Accumulated bytes acknowledged within the current flow.
    pub byte_f: [TvPairU; RESERVOIR_BINS],
    /// Bytes acknowledged by one normal ACK.
    pub byte_p: [TvPairU; RESERVOIR_BINS],
    /// Advertised TCP window.
    pub win: [TvPairU; RESERVOIR_BINS],
    /// Window delta between consecutive normal ACKs.
    pub d_win: [TvPairI; RESERVOIR_BINS],
    /// Flow complete time.
    pub fct: [TvPairF; RESERVOIR_BINS],
    /// Flow duration so far, sampled on normal ACKs.
    pub flow_duration: [TvPairF; RESERVOIR_BINS],
    /// Flow inter-arrival time for this backend.
    pub iat_f: [TvPairF; RESERVOIR_BINS],
    /// Packet inter-arrival time for this backend.
    pub iat_p: [TvPairF; RESERVOIR_BINS],
    /// Packet inter-arrival time within one flow.
    pub iat_ppf: [TvPairF; RESERVOIR_BINS],
    /// Server processing time of the first data packet (ms).
    pub pt_1st: [TvPairU; RESERVOIR_BINS],
    /// Server processing time of later data packets (ms).
    pub pt_gen: [TvPairU; RESERVOIR_BINS],
    /// Latency between SYN and first ACK.
    pub lat_synack: [TvPairF; RESERVOIR_BINS],
}

/// Per-VIP reservoir block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VipReservoir {
    /// Flow inter-arrival time across all backends of the VIP.
    pub iat_f_lb: [TvPairF; RESERVOIR_BINS],
}

/// Draw the bin index used by every family touched by one packet.
#[inline(always)]
pub fn random_bin<R: Rng>(rng: &mut R) -> usize {
    rng.gen_range(0..RESERVOIR_BINS)
}

#[inline(always)]
pub fn put_f(bins: &mut [TvPairF; RESERVOIR_BINS], idx: usize, t: f32, v: f32) {
    bins[idx] = TvPairF { t, v };
}

#[inline(always)]
pub fn put_u(bins: &mut [TvPairU; RESERVOIR_BINS], idx: usize, t: f32, v: u32) {
    bins[idx] = TvPairU { t, v };
}

#[inline(always)]
pub fn put_i(bins: &mut [TvPairI; RESERVOIR_BINS], idx: usize, t: f32, v: i32) {
    bins[idx] = TvPairI { t, v };
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_put_overwrites_single_bin() {
        let mut res = AsReservoir::default();
        put_f(&mut res.fct, 7, 1.5, 0.25);
        assert_eq!(res.fct[7], TvPairF { t: 1.5, v: 0.25 });
        // Every other bin is untouched.
        for (i, bin) in res.fct.iter().enumerate() {
            if i != 7 {
                assert_eq!(*bin, TvPairF::default());
            }
        }
    }

    #[test]
    fn test_random_bin_in_range_and_covers() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut hit = [false; RESERVOIR_BINS];
        for _ in 0..4096 {
            let idx = random_bin(&mut rng);
            assert!(idx < RESERVOIR_BINS);
            hit[idx] = true;
        }
        // 4096 uniform draws over 32 bins miss a bin with probability ~2e-57.
        assert!(hit.iter().all(|h| *h));
    }

    #[test]
    fn test_random_bin_roughly_uniform() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut counts = [0u32; RESERVOIR_BINS];
        let draws = 320_000;
        for _ in 0..draws {
            counts[random_bin(&mut rng)] += 1;
        }
        let expected = (draws / RESERVOIR_BINS as u32) as f64;
        for &c in &counts {
            // Within 10% of the expected 10k per bin.
            assert!((c as f64 - expected).abs() < expected * 0.1, "skewed bin: {c}");
        }
    }
}
