//! Fixed-size flow-hash table with lazy eviction.
//!
//! The table maps a 32-bit flow fingerprint to a backend index. It trades
//! reliability for speed: inserts may be dropped when a bucket is full, and
//! expired slots are reclaimed lazily on lookup rather than by a sweeper.
//! Each bucket holds four slots laid out column-wise so the liveness and
//! match scans read consecutive words; the scalar scan below realises the
//! same observable result a four-lane SIMD compare would (first matching
//! slot wins, first non-live slot wins for the free index).

use crate::clock::time_after;
use crate::tcp::PacketInfo;
use anyhow::{bail, Result};

/// Number of slots per bucket.
pub const ENTRIES_PER_BUCKET: usize = 4;

/// One bucket: four slots in column-major order, cache-line aligned.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Bucket {
    pub hash: [u32; ENTRIES_PER_BUCKET],
    pub timeout: [u32; ENTRIES_PER_BUCKET],
    pub vip: [u32; ENTRIES_PER_BUCKET],
    pub value: [u32; ENTRIES_PER_BUCKET],
    // Telemetry columns.
    pub t_last: [f32; ENTRIES_PER_BUCKET],
    pub t_init: [f32; ENTRIES_PER_BUCKET],
    pub ack_last: [u32; ENTRIES_PER_BUCKET],
    pub ack_init: [u32; ENTRIES_PER_BUCKET],
    pub tsecr_last: [u32; ENTRIES_PER_BUCKET],
    pub src_ip: [u32; ENTRIES_PER_BUCKET],
    pub src_port: [u16; ENTRIES_PER_BUCKET],
    pub win_last: [u16; ENTRIES_PER_BUCKET],
    pub tcp_flag: [u8; ENTRIES_PER_BUCKET],
}

/// Outcome of a bucket scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup {
    /// A live slot matched; its timeout has been refreshed.
    Hit { value: u32, index: usize },
    /// No live slot matched. `avail` is the first reclaimable slot, already
    /// suppressed to `None` for non-SYN packets so that mid-flow strays never
    /// claim state.
    Miss { avail: Option<usize> },
}

pub struct FlowTable {
    mask: u32,
    timeout: u32,
    /// `mask + 1` buckets plus one sentinel so a prefetch of the last bucket
    /// can overrun without touching foreign memory.
    buckets: Vec<Bucket>,
}

impl FlowTable {
    pub fn new(buckets: u32, timeout_sec: u32) -> Result<Self> {
        if buckets == 0 || !buckets.is_power_of_two() {
            bail!("flow table size must be a power of two, got {buckets}");
        }
        Ok(Self {
            mask: buckets - 1,
            timeout: timeout_sec,
            buckets: vec![Bucket::default(); buckets as usize + 1],
        })
    }

    #[inline]
    pub fn bucket_count(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    pub fn bucket_mut(&mut self, hash: u32) -> &mut Bucket {
        &mut self.buckets[(hash & self.mask) as usize]
    }

    /// Issue a read prefetch for the bucket the fingerprint maps to.
    #[inline(always)]
    pub fn prefetch(&self, hash: u32) {
        let bucket = &self.buckets[(hash & self.mask) as usize];
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch(bucket as *const Bucket as *const i8, _MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = bucket;
    }

    /// Scan the bucket for `(hash, vip)`. On a hit the slot's timeout is
    /// refreshed to `now + T`. On a miss, `avail` names the first non-live
    /// slot — but only for SYN packets; any other packet falls through to
    /// stateless forwarding without claiming a slot.
    pub fn lookup(&mut self, hash: u32, vip: u32, now: u32, syn: bool) -> Lookup {
        let timeout = self.timeout;
        let bucket = &mut self.buckets[(hash & self.mask) as usize];
        let mut avail = None;
        for i in 0..ENTRIES_PER_BUCKET {
            let live = time_after(bucket.timeout[i], now);
            if live && bucket.hash[i] == hash && bucket.vip[i] == vip {
                bucket.timeout[i] = now.wrapping_add(timeout);
                return Lookup::Hit { value: bucket.value[i], index: i };
            }
            if !live && avail.is_none() {
                avail = Some(i);
            }
        }
        Lookup::Miss { avail: if syn { avail } else { None } }
    }

    /// Install a flow in slot `index` of the bucket. The caller runs the
    /// previous tenant's wrap-up first (the slot's old fields are consumed
    /// there); this only stamps the new identity and flow-start telemetry.
    ///
    /// Writers are single-threaded per bucket by the run-to-completion model,
    /// so no concurrency check is made. Inserts are lossy by design: with no
    /// free slot the caller simply forwards statelessly.
    pub fn insert(&mut self, hash: u32, vip: u32, value: u32, index: usize, now: u32, pkt: &PacketInfo) {
        let timeout = self.timeout;
        let bucket = &mut self.buckets[(hash & self.mask) as usize];
        bucket.hash[index] = hash;
        bucket.vip[index] = vip;
        bucket.value[index] = value;
        bucket.timeout[index] = now.wrapping_add(timeout);
        bucket.t_init[index] = pkt.time_now;
        bucket.src_ip[index] = pkt.src_ip;
        bucket.src_port[index] = pkt.src_port;
        bucket.ack_last[index] = 0;
        bucket.ack_init[index] = 0;
        bucket.tsecr_last[index] = 0;
        bucket.win_last[index] = 0;
    }

    /// Count live slots across the whole table. O(N); diagnostic only.
    pub fn live_entries(&self, now: u32) -> usize {
        self.buckets[..self.bucket_count() as usize]
            .iter()
            .map(|b| {
                b.timeout
                    .iter()
                    .filter(|&&t| time_after(t, now))
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TCP_SYN;

    fn syn_pkt(src_ip: u32, src_port: u16, t: f32) -> PacketInfo {
        PacketInfo {
            time_now: t,
            src_ip,
            src_port,
            tcp_flag: TCP_SYN,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_non_pow2() {
        assert!(FlowTable::new(1000, 30).is_err());
        assert!(FlowTable::new(0, 30).is_err());
        assert!(FlowTable::new(1024, 30).is_ok());
    }

    #[test]
    fn test_insert_then_hit() {
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(0xC0A8_0001, 1234, 0.0);
        t.insert(0xDEAD_BEEF, 7, 3, 0, 10, &pkt);
        match t.lookup(0xDEAD_BEEF, 7, 11, false) {
            Lookup::Hit { value, index } => {
                assert_eq!(value, 3);
                assert_eq!(index, 0);
            }
            other => panic!("expected hit, got {other:?}"),
        }
        // Different VIP on the same fingerprint is not a match.
        assert!(matches!(
            t.lookup(0xDEAD_BEEF, 8, 11, false),
            Lookup::Miss { avail: None }
        ));
    }

    #[test]
    fn test_hit_refreshes_timeout() {
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(1, 1, 0.0);
        t.insert(42, 1, 0, 0, 0, &pkt);
        // Touch at t=29; the slot must now survive until 59.
        assert!(matches!(t.lookup(42, 1, 29, false), Lookup::Hit { .. }));
        assert!(matches!(t.lookup(42, 1, 58, false), Lookup::Hit { .. }));
    }

    #[test]
    fn test_lazy_eviction() {
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(1, 1, 0.0);
        t.insert(42, 1, 5, 0, 0, &pkt);
        // Expired at t=31: no hit, and the slot is reclaimable by a SYN.
        match t.lookup(42, 1, 31, true) {
            Lookup::Miss { avail } => assert_eq!(avail, Some(0)),
            other => panic!("expected miss, got {other:?}"),
        }
        assert_eq!(t.live_entries(31), 0);
    }

    #[test]
    fn test_non_syn_never_claims_slot() {
        let mut t = FlowTable::new(64, 30).unwrap();
        match t.lookup(42, 1, 0, false) {
            Lookup::Miss { avail } => assert_eq!(avail, None),
            other => panic!("expected miss, got {other:?}"),
        }
        match t.lookup(42, 1, 0, true) {
            Lookup::Miss { avail } => assert_eq!(avail, Some(0)),
            other => panic!("expected miss, got {other:?}"),
        }
    }

    #[test]
    fn test_at_most_one_live_match_per_bucket() {
        // Two inserts of the same (hash, vip) into different slots: the scan
        // must deterministically return the first, and after evicting it the
        // second becomes visible — at most one live match at any time.
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(1, 1, 0.0);
        t.insert(42, 1, 10, 0, 0, &pkt);
        t.insert(42, 1, 11, 1, 0, &pkt);
        match t.lookup(42, 1, 1, false) {
            Lookup::Hit { value, index } => {
                assert_eq!((value, index), (10, 0));
            }
            other => panic!("expected hit, got {other:?}"),
        }
        t.bucket_mut(42).timeout[0] = 0; // evict slot 0
        match t.lookup(42, 1, 1, false) {
            Lookup::Hit { value, index } => {
                assert_eq!((value, index), (11, 1));
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn test_first_free_slot_wins() {
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(1, 1, 0.0);
        for i in 0..ENTRIES_PER_BUCKET {
            t.insert(100 + i as u32 * 64, 1, i as u32, i, 0, &pkt);
        }
        // All four slots live: a SYN for a new flow finds no room.
        match t.lookup(9999 * 64 + 36, 1, 1, true) {
            Lookup::Miss { avail } => assert_eq!(avail, None),
            other => panic!("expected full bucket, got {other:?}"),
        }
        // Expire slot 2 only; it must be the one handed out.
        t.bucket_mut(36).timeout[2] = 0;
        match t.lookup(9999 * 64 + 36, 1, 1, true) {
            Lookup::Miss { avail } => assert_eq!(avail, Some(2)),
            other => panic!("expected miss, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_wraparound() {
        // A slot written just before the u32 wrap must stay live across it.
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(1, 1, 0.0);
        let now = u32::MAX - 5;
        t.insert(42, 1, 3, 0, now, &pkt);
        // 10 seconds later the counter has wrapped to 4.
        assert!(matches!(t.lookup(42, 1, 4, false), Lookup::Hit { .. }));
        assert_eq!(t.live_entries(4), 1);
        // 40 seconds later the slot has expired.
        assert!(matches!(
            t.lookup(42, 1, 34, false),
            Lookup::Miss { avail: None }
        ));
    }

    #[test]
    fn test_live_entries_counts() {
        let mut t = FlowTable::new(64, 30).unwrap();
        let pkt = syn_pkt(1, 1, 0.0);
        t.insert(1, 1, 0, 0, 0, &pkt);
        t.insert(2, 1, 0, 0, 0, &pkt);
        t.insert(3, 1, 0, 0, 0, &pkt);
        assert_eq!(t.live_entries(10), 3);
        assert_eq!(t.live_entries(40), 0);
    }
}
