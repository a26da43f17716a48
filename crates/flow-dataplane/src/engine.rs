//! Per-packet orchestration for one VIP.
//!
//! Single-threaded run-to-completion: the host framework hands each packet to
//! exactly one worker, so nothing here locks, blocks or yields. Per packet:
//! scan the flow table; on a hit run the TCP state update; on a SYN miss pick
//! a backend (alias weights when the consumer has delivered any, a hash over
//! the active set otherwise) and install the flow; on any other miss forward
//! statelessly. Telemetry frames go out and weight frames come in on a fixed
//! cadence driven by [`VipDataplane::poll`].

use crate::alias;
use crate::config::DataplaneConfig;
use crate::reservoir::random_bin;
use crate::shm::{VipShm, VipState};
use crate::stats::AS_MAX;
use crate::table::{FlowTable, Lookup};
use crate::tcp::{self, PacketInfo, TcpTuning, TCP_SYN};
use anyhow::Result;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::debug;

/// Routing decision for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Backend index the packet is forwarded to.
    pub backend: u32,
    /// Whether the packet is covered by per-flow state (hit or fresh install).
    pub installed: bool,
}

pub struct VipDataplane {
    vip_id: u32,
    table: FlowTable,
    shm: VipShm,
    tune: TcpTuning,
    publish_interval: f32,
    last_publish: f32,
    rng: SmallRng,
}

impl VipDataplane {
    /// Build the data plane for one VIP over an already created region.
    pub fn new(vip_id: u32, cfg: &DataplaneConfig, shm: VipShm) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            vip_id,
            table: FlowTable::new(cfg.buckets, cfg.timeout_sec)?,
            shm,
            tune: TcpTuning {
                flow_decay: cfg.flow_decay,
                default_flow_timeout: cfg.default_flow_timeout_sec,
                pt_offset_ms: cfg.pt_offset_ms,
            },
            publish_interval: cfg.publish_interval,
            last_publish: 0.0,
            rng: SmallRng::from_entropy(),
        })
    }

    pub fn vip_id(&self) -> u32 {
        self.vip_id
    }

    pub fn register_backend(&mut self, id: u32) -> Result<()> {
        self.shm.register_as(id)
    }

    pub fn remove_backend(&mut self, id: u32) -> Result<()> {
        self.shm.remove_as(id)
    }

    #[inline]
    pub fn state(&self) -> &VipState {
        self.shm.state()
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Process one TCP packet of this VIP. Total: every packet gets a
    /// dispatch, whatever its shape.
    pub fn process(&mut self, hash: u32, now_sec: u32, pkt: &mut PacketInfo) -> Dispatch {
        pkt.d_n_flow = 0;
        self.table.prefetch(hash);
        let res_idx = random_bin(&mut self.rng);
        let syn = pkt.tcp_flag & TCP_SYN != 0;
        let vip = self.vip_id;

        match self.table.lookup(hash, vip, now_sec, syn) {
            Lookup::Hit { value, index } => {
                tcp::on_hit(
                    self.table.bucket_mut(hash),
                    index,
                    now_sec,
                    pkt,
                    self.shm.state_mut(),
                    value,
                    res_idx,
                    &self.tune,
                );
                Dispatch { backend: value, installed: true }
            }
            Lookup::Miss { avail: Some(index) } => {
                let backend = self.pick_backend(hash);
                tcp::on_miss_insert(
                    self.table.bucket_mut(hash),
                    index,
                    now_sec,
                    pkt,
                    self.shm.state_mut(),
                    backend,
                    res_idx,
                    &self.tune,
                );
                self.table.insert(hash, vip, backend, index, now_sec, pkt);
                Dispatch { backend, installed: true }
            }
            Lookup::Miss { avail: None } => {
                if syn {
                    // Bucket full: the flow is still routed, just untracked.
                    debug!(vip, hash, "bucket full, forwarding SYN without state");
                    Dispatch { backend: self.pick_backend(hash), installed: false }
                } else {
                    Dispatch { backend: self.route_stateless(hash), installed: false }
                }
            }
        }
    }

    /// Pick a backend for a new flow: consumer-delivered alias weights when
    /// available, otherwise the stateless hash over the active set.
    fn pick_backend(&mut self, hash: u32) -> u32 {
        if self.shm.state().in_cache.id > 0 {
            alias::sample(&self.shm.state().in_cache.weights, &mut self.rng)
        } else {
            self.route_stateless(hash)
        }
    }

    /// Deterministic hash spread over the active backends — the stand-in for
    /// the host framework's consistent-hash stage. Also serves non-TCP
    /// traffic, which is hashed and forwarded but never tracked.
    pub fn route_stateless(&self, hash: u32) -> u32 {
        let active = self.shm.state().out_cache.active;
        let n = active.count_ones();
        if n == 0 {
            return 0;
        }
        let mut k = hash % n;
        for i in 0..AS_MAX {
            if active & (1u64 << i) != 0 {
                if k == 0 {
                    return i as u32;
                }
                k -= 1;
            }
        }
        0
    }

    /// Publish/consume tick: every `publish_interval` seconds, seal the next
    /// outbound frame and pull the freshest inbound weights.
    pub fn poll(&mut self, now: f32) -> bool {
        if now - self.last_publish < self.publish_interval {
            return false;
        }
        self.last_publish = now;
        self.shm.publish(now);
        self.shm.fetch_weights();
        true
    }

    /// Live flows currently tracked. O(table size).
    pub fn live_flows(&self, now_sec: u32) -> usize {
        self.table.live_entries(now_sec)
    }

    /// Tear down the VIP: drop the table, unmap and unlink the region.
    pub fn destroy(self) -> Result<()> {
        self.shm.destroy()
    }
}
