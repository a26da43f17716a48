//! Wire records shared with the out-of-band consumer.
//!
//! Every type here is `#[repr(C)]` and lands in the shared-memory region at
//! the offsets computed in [`layout`]. The field order of each record and the
//! order of the blocks in the region are part of the wire contract — the
//! external consumer reads the same offsets.

/// Per-VIP backend capacity. Sizes the `#[repr(C)]` body arrays, so it is a
/// compile-time constant rather than runtime configuration.
pub const AS_MAX: usize = 64;

/// Ring depth for both message directions (power of two).
pub const FRAME_COUNT: usize = 4;
pub const FRAME_MASK: u32 = FRAME_COUNT as u32 - 1;

/// Reserved header bytes before the typed layout begins.
pub const SHM_OFFSET: usize = 42;

/// Wrapping counter increment. Counters are snapshotted periodically and the
/// consumer recovers rates by unsigned diff, so wrap is harmless.
#[inline(always)]
pub fn bump(counter: &mut u32) {
    *counter = counter.wrapping_add(1);
}

/// Per-VIP reference timestamps.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RefLb {
    /// First timestamp observed on this node (ms), baseline for processing-time estimates.
    pub t0: u32,
    /// Arrival time of the most recent new flow on the VIP.
    pub t_last_flow: f32,
}

/// Per-backend reference timestamps.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RefAs {
    /// Server clock baseline derived from the first valid timestamp echo (ms).
    pub t0_ecr: u32,
    /// Arrival time of the most recent new flow on this backend.
    pub t_last_flow: f32,
    /// Arrival time of the most recent packet on this backend.
    pub t_last_packet: f32,
}

/// Per-backend counters, snapshotted into every outbound frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AsStat {
    pub as_index: u32,
    /// Instantaneous established-flow estimate; signed, decays geometrically.
    pub n_flow_on: i32,
    /// New incoming flows.
    pub n_flow: u32,
    /// Completed flows.
    pub n_fct: u32,
    /// Packets.
    pub n_packet: u32,
    /// Normal ACKs.
    pub n_norm_ack: u32,
    /// Retransmissions.
    pub n_rtr: u32,
    /// Duplicated ACKs.
    pub n_dpk: u32,
    /// Out-of-order packets.
    pub n_ooo: u32,
    /// Fingerprint collisions with a live slot owned by another source.
    pub n_cls: u32,
}

/// One bin of the weighted-alias table delivered by the consumer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AliasEntry {
    /// Probability of keeping the drawn bin.
    pub odd: f32,
    /// Bin to redirect to otherwise.
    pub alias: u32,
}

impl Default for AliasEntry {
    fn default() -> Self {
        Self { odd: 1.0, alias: 0 }
    }
}

/// Outbound telemetry frame: counters for every backend plus the active bitmap.
///
/// `id` doubles as the seal: the writer stores it last, readers accept a frame
/// only when its id is strictly newer than the last one they accepted.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsgOut {
    pub id: u32,
    pub ts: f32,
    /// Bit `i` set iff backend `i` is currently active.
    pub active: u64,
    pub body: [AsStat; AS_MAX],
}

impl Default for MsgOut {
    fn default() -> Self {
        Self {
            id: 0,
            ts: 0.0,
            active: 0,
            body: [AsStat::default(); AS_MAX],
        }
    }
}

impl MsgOut {
    #[inline]
    pub fn mark_active(&mut self, id: usize) {
        self.active |= 1u64 << id;
    }

    #[inline]
    pub fn mark_inactive(&mut self, id: usize) {
        self.active &= !(1u64 << id);
    }

    #[inline]
    pub fn is_active(&self, id: usize) -> bool {
        self.active & (1u64 << id) != 0
    }
}

/// Inbound weight frame written by the consumer, sealed by `id` as well.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsgIn {
    pub id: u32,
    pub ts: f32,
    /// Raw per-backend scores, informational.
    pub score: [f32; AS_MAX],
    /// Alias table used to pick backends for new flows.
    pub weights: [AliasEntry; AS_MAX],
}

impl Default for MsgIn {
    fn default() -> Self {
        Self {
            id: 0,
            ts: 0.0,
            score: [0.0; AS_MAX],
            weights: [AliasEntry::default(); AS_MAX],
        }
    }
}

/// Byte offsets of every block in the shared region, relative to the start of
/// the typed layout (region base + [`SHM_OFFSET`]). Blocks are packed
/// back-to-back with no realignment — the wire contract fixes the cumulative
/// sums, not any ABI alignment.
pub mod layout {
    use super::*;
    use crate::reservoir::{AsReservoir, VipReservoir};
    use core::mem::size_of;

    pub const N_AS: usize = 0;
    pub const REF_LB: usize = N_AS + 1;
    pub const REF_AS: usize = REF_LB + size_of::<RefLb>();
    pub const MSG_OUT_CACHE: usize = REF_AS + AS_MAX * size_of::<RefAs>();
    pub const MSG_OUT_FRAMES: usize = MSG_OUT_CACHE + size_of::<MsgOut>();
    pub const RES_LB: usize = MSG_OUT_FRAMES + FRAME_COUNT * size_of::<MsgOut>();
    pub const RES_AS: usize = RES_LB + size_of::<VipReservoir>();
    pub const MSG_IN_CACHE: usize = RES_AS + AS_MAX * size_of::<AsReservoir>();
    pub const MSG_IN_FRAMES: usize = MSG_IN_CACHE + size_of::<MsgIn>();
    pub const END: usize = MSG_IN_FRAMES + FRAME_COUNT * size_of::<MsgIn>();

    /// Offset of outbound frame `k` within the typed layout.
    #[inline]
    pub const fn msg_out_frame(k: usize) -> usize {
        MSG_OUT_FRAMES + k * size_of::<MsgOut>()
    }

    /// Offset of inbound frame `k` within the typed layout.
    #[inline]
    pub const fn msg_in_frame(k: usize) -> usize {
        MSG_IN_FRAMES + k * size_of::<MsgIn>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservoir::{AsReservoir, VipReservoir};
    use core::mem::size_of;

    /// Wire-contract regression: record sizes and block offsets must never
    /// drift — the external consumer hardcodes the same numbers.
    #[test]
    fn test_record_sizes() {
        assert_eq!(size_of::<RefLb>(), 8);
        assert_eq!(size_of::<RefAs>(), 12);
        assert_eq!(size_of::<AsStat>(), 40);
        assert_eq!(size_of::<AliasEntry>(), 8);
        assert_eq!(size_of::<MsgOut>(), 16 + 64 * 40);
        assert_eq!(size_of::<MsgIn>(), 8 + 64 * 4 + 64 * 8);
        assert_eq!(size_of::<AsReservoir>(), 12 * 32 * 8);
        assert_eq!(size_of::<VipReservoir>(), 32 * 8);
    }

    #[test]
    fn test_layout_offsets() {
        assert_eq!(layout::N_AS, 0);
        assert_eq!(layout::REF_LB, 1);
        assert_eq!(layout::REF_AS, 9);
        assert_eq!(layout::MSG_OUT_CACHE, 777);
        assert_eq!(layout::MSG_OUT_FRAMES, 3_353);
        assert_eq!(layout::RES_LB, 13_657);
        assert_eq!(layout::RES_AS, 13_913);
        assert_eq!(layout::MSG_IN_CACHE, 210_521);
        assert_eq!(layout::MSG_IN_FRAMES, 211_297);
        assert_eq!(layout::END, 214_401);
        // The whole layout fits the default 1 MiB region.
        assert!(SHM_OFFSET + layout::END <= 1_048_576);
    }

    #[test]
    fn test_active_bitmap() {
        let mut out = MsgOut::default();
        out.mark_active(0);
        out.mark_active(63);
        assert!(out.is_active(0));
        assert!(out.is_active(63));
        assert!(!out.is_active(5));
        out.mark_inactive(63);
        assert!(!out.is_active(63));
        assert_eq!(out.active, 1);
    }

    #[test]
    fn test_counter_wrap() {
        let mut c = u32::MAX;
        bump(&mut c);
        assert_eq!(c, 0);
    }
}
