//! Per-flow TCP state machine.
//!
//! Two entry points, chosen by the flow-table scan: [`on_hit`] runs when a
//! packet lands on its live slot, [`on_miss_insert`] when a SYN claims a free
//! slot. Both mutate the slot columns in place and account into the backend's
//! counters and reservoirs. Neither can fail; weird packets are classified
//! and counted, never rejected.

use crate::reservoir::{put_f, put_i, put_u};
use crate::shm::VipState;
use crate::stats::bump;
use crate::table::Bucket;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// Empty slot marker.
pub const TCP_FLAGS_NONE: u8 = 0;
/// Clean close as seen from the balancer.
pub const TCP_FLAGS_RSTACK: u8 = TCP_RST | TCP_ACK;

/// Per-packet record handed in by the capture layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketInfo {
    /// High-resolution arrival time, float seconds.
    pub time_now: f32,
    /// ACK number from the TCP header.
    pub tcp_ack: u32,
    /// Timestamp echo reply from the TCP options, 0 when absent.
    pub tsecr: u32,
    /// Source address, used as slot-ownership entropy.
    pub src_ip: u32,
    pub src_port: u16,
    /// Advertised window.
    pub tcp_win: u16,
    pub tcp_flag: u8,
    /// Flow-count delta produced while processing this packet (+1 new flow,
    /// -1 flow closed); folded into `n_flow_on` at the end of the update.
    pub d_n_flow: i8,
}

/// State-machine tuning, lifted from [`crate::config::DataplaneConfig`].
#[derive(Debug, Clone, Copy)]
pub struct TcpTuning {
    /// Geometric decay of `n_flow_on` per packet on the hit path.
    pub flow_decay: f32,
    /// Assumed flow timeout when estimating the completion time of a lazily
    /// evicted flow.
    pub default_flow_timeout: f32,
    /// Millisecond offset applied when seeding the VIP clock baseline.
    pub pt_offset_ms: u32,
}

/// How one packet was classified against its slot's previous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Normal,
    FirstSyn,
    FirstAck,
    /// ACK to the first data packet of a query.
    FirstData,
    /// PSH-ACK opening a (new) query on the flow.
    Query,
    /// RST-ACK closing the flow.
    FlowClose,
    RetrSyn,
    RetrRst,
    RetrQuery,
    OooAck,
    OooQuery,
    DupAck,
    /// Flag combination the tracker does not model (FIN teardown, SYN-ACK
    /// from the client side, ...): counted in `n_packet` only.
    BeyondScope,
}

impl PacketClass {
    /// Whether this packet advances the slot's flag state. Retransmissions,
    /// reordered or duplicated packets and out-of-scope flag combinations
    /// leave the recorded state untouched.
    #[inline]
    pub fn records_state(self) -> bool {
        matches!(
            self,
            PacketClass::Normal
                | PacketClass::FirstSyn
                | PacketClass::FirstAck
                | PacketClass::FirstData
                | PacketClass::Query
                | PacketClass::FlowClose
        )
    }
}

#[inline(always)]
fn is_syn_only(flag: u8) -> bool {
    flag & TCP_SYN != 0 && flag & TCP_ACK == 0
}

#[inline(always)]
fn is_rst_only(flag: u8) -> bool {
    flag & TCP_RST != 0 && flag & TCP_ACK == 0
}

/// Update state for a packet that matched a live slot.
///
/// `value` is the backend the slot routes to and `res_idx` the reservoir bin
/// drawn for this packet. Returns the classification for callers that want it.
#[allow(clippy::too_many_arguments)]
pub fn on_hit(
    bucket: &mut Bucket,
    index: usize,
    now_sec: u32,
    pkt: &mut PacketInfo,
    state: &mut VipState,
    value: u32,
    res_idx: usize,
    tune: &TcpTuning,
) -> PacketClass {
    let VipState {
        ref_lb,
        ref_as,
        out_cache,
        res_as,
        ..
    } = state;
    let ref_as = &mut ref_as[value as usize];
    let stat = &mut out_cache.body[value as usize];
    let res = &mut res_as[value as usize];

    // A live slot owned by a different source: the fingerprint collided and
    // the slot was reused. Count it and forward without touching state.
    if bucket.src_ip[index] != pkt.src_ip || bucket.src_port[index] != pkt.src_port {
        bump(&mut stat.n_cls);
        bump(&mut stat.n_packet);
        return PacketClass::BeyondScope;
    }

    let t = pkt.time_now;

    let iat_p = t - ref_as.t_last_packet;
    ref_as.t_last_packet = t;
    put_f(&mut res.iat_p, res_idx, t, iat_p);

    let flag = pkt.tcp_flag;
    let flag_prev = bucket.tcp_flag[index];
    let mut class = PacketClass::Normal;

    if flag & TCP_ACK != 0 {
        let ack_cur = pkt.tcp_ack;
        if flag & !TCP_ACK != 0 {
            if flag & TCP_RST != 0 {
                // Flow close: evict the slot and record the completion.
                bucket.timeout[index] = now_sec.wrapping_sub(1);
                class = PacketClass::FlowClose;
                let fct = t - bucket.t_init[index];
                let iat_ppf = t - bucket.t_last[index];
                pkt.d_n_flow = -1;
                bump(&mut stat.n_fct);
                put_f(&mut res.fct, res_idx, t, fct);
                put_f(&mut res.iat_ppf, res_idx, t, iat_ppf);
            } else if flag & TCP_PSH != 0 {
                let ack_last = bucket.ack_last[index];
                if ack_cur == ack_last {
                    // New query on the flow; re-anchor the byte counter.
                    class = PacketClass::Query;
                    bucket.ack_init[index] = ack_cur;
                } else if ack_cur < ack_last {
                    bump(&mut stat.n_rtr);
                    class = PacketClass::RetrQuery;
                } else {
                    bump(&mut stat.n_ooo);
                    class = PacketClass::OooQuery;
                }
            } else {
                class = PacketClass::BeyondScope;
            }
        } else if flag_prev & TCP_ACK != 0 {
            // Established flow, pure ACK.
            let ack_last = bucket.ack_last[index];
            if ack_cur > ack_last {
                let byte_p = ack_cur.wrapping_sub(ack_last);
                let win = pkt.tcp_win as u32;
                let dwin = win as i32 - bucket.win_last[index] as i32;
                bucket.win_last[index] = pkt.tcp_win;
                bump(&mut stat.n_norm_ack);

                put_i(&mut res.d_win, res_idx, t, dwin);
                put_u(&mut res.byte_f, res_idx, t, ack_cur.wrapping_sub(bucket.ack_init[index]));
                put_f(&mut res.flow_duration, res_idx, t, t - bucket.t_init[index]);
                put_u(&mut res.byte_p, res_idx, t, byte_p);
                put_u(&mut res.win, res_idx, t, win);

                let tsecr = pkt.tsecr;
                if tsecr != 0 {
                    // Map the echoed server tick onto the balancer's ms
                    // timeline to estimate server processing time.
                    let now_ms = (t * 1000.0) as u32;
                    let pt = now_ms.wrapping_sub(tsecr.wrapping_add(ref_as.t0_ecr));
                    if ack_last == bucket.ack_init[index] {
                        put_u(&mut res.pt_1st, res_idx, t, pt);
                        bucket.tsecr_last[index] = tsecr;
                        class = PacketClass::FirstData;
                    } else if tsecr > bucket.tsecr_last[index] {
                        put_u(&mut res.pt_gen, res_idx, t, pt);
                        bucket.tsecr_last[index] = tsecr;
                    }
                }
                bucket.ack_last[index] = ack_cur;
            } else if ack_cur == ack_last {
                bump(&mut stat.n_dpk);
                class = PacketClass::DupAck;
            } else {
                bump(&mut stat.n_ooo);
                class = PacketClass::OooAck;
            }
            let iat_ppf = t - bucket.t_last[index];
            put_f(&mut res.iat_ppf, res_idx, t, iat_ppf);
        } else {
            // First ACK after the SYN: initialise the per-flow baselines.
            bucket.ack_last[index] = ack_cur;
            bucket.win_last[index] = pkt.tcp_win;
            class = PacketClass::FirstAck;
            let tsecr = pkt.tsecr;
            if tsecr != 0 {
                bucket.tsecr_last[index] = tsecr;
                if ref_as.t0_ecr == 0 {
                    if ref_lb.t0 == 0 {
                        // First valid echo on the VIP seeds the ms baseline;
                        // the offset absorbs the slow first response.
                        ref_lb.t0 = (bucket.t_last[index] * 1000.0) as u32 + tune.pt_offset_ms;
                    }
                    ref_as.t0_ecr = ref_lb.t0.wrapping_sub(tsecr);
                }
            }
            put_f(&mut res.lat_synack, res_idx, t, t - bucket.t_init[index]);
            let iat_ppf = t - bucket.t_last[index];
            put_f(&mut res.iat_ppf, res_idx, t, iat_ppf);
        }
    } else if is_syn_only(flag) {
        bump(&mut stat.n_rtr);
        class = PacketClass::RetrSyn;
    } else if is_rst_only(flag) {
        bump(&mut stat.n_rtr);
        class = PacketClass::RetrRst;
    } else {
        class = PacketClass::BeyondScope;
    }

    if class.records_state() {
        bucket.tcp_flag[index] = flag;
    }
    bucket.t_last[index] = t;
    bump(&mut stat.n_packet);
    stat.n_flow_on = (stat.n_flow_on as f32 * tune.flow_decay) as i32 + pkt.d_n_flow as i32;
    class
}

/// Update state for a SYN (or stray) packet that claimed a free slot.
///
/// Runs *before* the caller stamps the new identity into the slot: the old
/// columns are still the previous tenant's and are consumed here to wrap up a
/// flow that timed out without a clean close. `new_value` is the backend the
/// new flow was assigned to.
#[allow(clippy::too_many_arguments)]
pub fn on_miss_insert(
    bucket: &mut Bucket,
    index: usize,
    now_sec: u32,
    pkt: &mut PacketInfo,
    state: &mut VipState,
    new_value: u32,
    res_idx: usize,
    tune: &TcpTuning,
) -> PacketClass {
    let t = pkt.time_now;
    let prev_flag = bucket.tcp_flag[index];

    if prev_flag != TCP_FLAGS_NONE && prev_flag != TCP_FLAGS_RSTACK {
        // The previous tenant timed out mid-flow.
        let same_source = bucket.src_ip[index] == pkt.src_ip && bucket.src_port[index] == pkt.src_port;
        if same_source && bucket.value[index] == new_value {
            // Same flow re-arriving on the same backend: re-install silently.
            return PacketClass::Normal;
        }
        // Charge an estimated completion to the previous backend.
        let prev = bucket.value[index] as usize;
        let fct = t - bucket.t_init[index] - tune.default_flow_timeout;
        put_f(&mut state.res_as[prev].fct, res_idx, t, fct);
        let stat_prev = &mut state.out_cache.body[prev];
        stat_prev.n_flow_on -= 1;
        bump(&mut stat_prev.n_fct);
    }

    let VipState {
        ref_lb,
        ref_as,
        out_cache,
        res_lb,
        res_as,
        ..
    } = state;
    let ref_as = &mut ref_as[new_value as usize];
    let stat = &mut out_cache.body[new_value as usize];
    let res = &mut res_as[new_value as usize];

    let flag = pkt.tcp_flag;
    let mut class = PacketClass::Normal;

    if is_syn_only(flag) {
        if ref_as.t_last_flow > 0.1 {
            let iat_f = t - ref_as.t_last_flow;
            put_f(&mut res.iat_f, res_idx, t, iat_f);
            let iat_f_lb = t - ref_lb.t_last_flow;
            put_f(&mut res_lb.iat_f_lb, res_idx, t, iat_f_lb);
        } else if ref_lb.t0 == 0 {
            // Very first flow on the VIP.
            ref_lb.t0 = (t * 1000.0) as u32;
        }
        class = PacketClass::FirstSyn;
        bump(&mut stat.n_flow);
        pkt.d_n_flow = 1;
        ref_as.t_last_flow = t;
        ref_lb.t_last_flow = t;
    } else if is_rst_only(flag) {
        // RST landing on an empty slot: count and pre-evict.
        bump(&mut stat.n_rtr);
        class = PacketClass::RetrRst;
        bucket.timeout[index] = now_sec.wrapping_sub(1);
    } else {
        class = PacketClass::BeyondScope;
    }

    if class.records_state() {
        bucket.tcp_flag[index] = flag;
    }
    bucket.t_last[index] = t;
    bump(&mut stat.n_packet);
    let iat_p = t - ref_as.t_last_packet;
    put_f(&mut res.iat_p, res_idx, t, iat_p);
    ref_as.t_last_packet = t;
    stat.n_flow_on += pkt.d_n_flow as i32;
    class
}
