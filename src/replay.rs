//! `flowplane replay` — drive the data plane from a capture file.
//!
//! Reads a pcap, walks each frame, and feeds TCP packets through the fast
//! path exactly as the host framework would: fingerprint, lookup, state
//! update, dispatch. Time comes from the capture timestamps (rebased to the
//! first frame), so replays are deterministic and publish ticks fire at the
//! configured cadence in capture time. Non-TCP frames are hashed and
//! forwarded statelessly, and counted per protocol.
//!
//! Snapshot JSONL lines go through a dedicated writer thread so the packet
//! loop never blocks on file I/O.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender};
use flow_dataplane::{PacketInfo, VipDataplane, VipShm};
use pcap_file::pcap::PcapReader;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::FlowplaneConfig;
use crate::parse::{self, Parsed};

#[derive(Serialize)]
struct SnapshotLine {
    /// Wall-clock time the line was written.
    wall: String,
    /// Capture-relative time of the snapshot.
    t: f32,
    live_flows: usize,
    backends: Vec<BackendSnap>,
}

#[derive(Serialize)]
struct BackendSnap {
    as_index: u32,
    flows_on: i32,
    packets_per_sec: f64,
    flows_per_sec: f64,
    n_packet: u32,
    n_flow: u32,
    n_fct: u32,
    n_norm_ack: u32,
    n_rtr: u32,
    n_dpk: u32,
    n_ooo: u32,
    n_cls: u32,
}

#[derive(Serialize)]
struct ReplaySummary {
    packets_total: u64,
    tcp: u64,
    udp: u64,
    icmp: u64,
    igmp: u64,
    other: u64,
    installed: u64,
    stateless: u64,
    live_flows_at_end: usize,
    avg_process_ns: u64,
    backends: Vec<BackendSnap>,
}

/// Spawn the JSONL writer. Lines arrive over a bounded channel; the thread
/// owns the output handle and drains until the sender side closes.
fn spawn_writer(output: Option<PathBuf>) -> Result<(Sender<String>, std::thread::JoinHandle<()>)> {
    let mut sink: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(
            File::create(&path).with_context(|| format!("create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    let (tx, rx) = bounded::<String>(1024);
    let handle = std::thread::Builder::new()
        .name("snapshot-writer".into())
        .spawn(move || {
            for line in rx {
                if writeln!(sink, "{line}").is_err() {
                    break;
                }
            }
            let _ = sink.flush();
        })
        .expect("failed to spawn snapshot writer");
    Ok((tx, handle))
}

fn backend_snaps(dp: &VipDataplane, backends: &[u32], prev: &[flow_dataplane::AsStat], elapsed: f64) -> Vec<BackendSnap> {
    backends
        .iter()
        .zip(prev.iter())
        .map(|(&id, p)| {
            let s = dp.state().stat(id);
            BackendSnap {
                as_index: id,
                flows_on: s.n_flow_on,
                packets_per_sec: if elapsed > 0.0 {
                    s.n_packet.wrapping_sub(p.n_packet) as f64 / elapsed
                } else {
                    0.0
                },
                flows_per_sec: if elapsed > 0.0 {
                    s.n_flow.wrapping_sub(p.n_flow) as f64 / elapsed
                } else {
                    0.0
                },
                n_packet: s.n_packet,
                n_flow: s.n_flow,
                n_fct: s.n_fct,
                n_norm_ack: s.n_norm_ack,
                n_rtr: s.n_rtr,
                n_dpk: s.n_dpk,
                n_ooo: s.n_ooo,
                n_cls: s.n_cls,
            }
        })
        .collect()
}

pub fn run(config: &FlowplaneConfig, pcap_path: &Path, output: Option<PathBuf>, keep_shm: bool) -> Result<()> {
    let shm = VipShm::create(config.vip, config.dataplane.shm_size)?;
    let mut dp = VipDataplane::new(config.vip, &config.dataplane, shm)?;
    for &id in &config.backends {
        dp.register_backend(id)?;
    }
    info!(
        "replay — vip {} with {} backend(s), {} buckets",
        config.vip,
        config.backends.len(),
        config.dataplane.buckets
    );

    let file = File::open(pcap_path)
        .with_context(|| format!("open capture {}", pcap_path.display()))?;
    let mut reader = PcapReader::new(file).context("not a pcap file")?;
    let (snap_tx, writer) = spawn_writer(output)?;

    let mut base_ts = None;
    let mut last_snap_t = 0.0f32;
    let mut prev_stats: Vec<flow_dataplane::AsStat> =
        config.backends.iter().map(|&id| *dp.state().stat(id)).collect();

    let mut packets_total = 0u64;
    let (mut tcp, mut udp, mut icmp, mut igmp, mut other) = (0u64, 0u64, 0u64, 0u64, 0u64);
    let (mut installed, mut stateless) = (0u64, 0u64);
    let mut process_ns = 0u64;
    let mut process_count = 0u64;

    while let Some(pkt) = reader.next_packet() {
        let pkt = match pkt {
            Ok(p) => p,
            Err(e) => {
                warn!("capture read error, stopping replay: {e}");
                break;
            }
        };
        packets_total += 1;

        let base = *base_ts.get_or_insert(pkt.timestamp);
        let t = pkt.timestamp.saturating_sub(base).as_secs_f32();
        let now_sec = t as u32;

        // Publish cadence runs on capture time, before the packet itself.
        if dp.poll(t) {
            let elapsed = f64::from(t - last_snap_t);
            let line = SnapshotLine {
                wall: chrono::Utc::now().to_rfc3339(),
                t,
                live_flows: dp.live_flows(now_sec),
                backends: backend_snaps(&dp, &config.backends, &prev_stats, elapsed),
            };
            prev_stats = config.backends.iter().map(|&id| *dp.state().stat(id)).collect();
            last_snap_t = t;
            if let Ok(json) = serde_json::to_string(&line) {
                let _ = snap_tx.try_send(json);
            }
        }

        match parse::parse_frame(&pkt.data) {
            Some(Parsed::Tcp(fields)) => {
                tcp += 1;
                let hash = parse::flow_fingerprint(
                    fields.src_ip,
                    fields.dst_ip,
                    fields.src_port,
                    fields.dst_port,
                    6,
                );
                let mut info = PacketInfo {
                    time_now: t,
                    tcp_ack: fields.ack,
                    tsecr: fields.tsecr,
                    src_ip: fields.src_ip,
                    src_port: fields.src_port,
                    tcp_win: fields.win,
                    tcp_flag: fields.flags,
                    d_n_flow: 0,
                };
                let start = Instant::now();
                let dispatch = dp.process(hash, now_sec, &mut info);
                process_ns += start.elapsed().as_nanos() as u64;
                process_count += 1;
                if dispatch.installed {
                    installed += 1;
                } else {
                    stateless += 1;
                }
            }
            Some(Parsed::Stateless { proto, src_ip, dst_ip }) => {
                match proto {
                    parse::IPPROTO_UDP => udp += 1,
                    parse::IPPROTO_ICMP => icmp += 1,
                    parse::IPPROTO_IGMP => igmp += 1,
                    _ => other += 1,
                }
                let hash = parse::flow_fingerprint(src_ip, dst_ip, 0, 0, proto);
                let _ = dp.route_stateless(hash);
                stateless += 1;
            }
            None => other += 1,
        }
    }

    let end_sec = last_snap_t as u32 + 1;
    let summary = ReplaySummary {
        packets_total,
        tcp,
        udp,
        icmp,
        igmp,
        other,
        installed,
        stateless,
        live_flows_at_end: dp.live_flows(end_sec),
        avg_process_ns: if process_count > 0 { process_ns / process_count } else { 0 },
        backends: backend_snaps(&dp, &config.backends, &prev_stats, 0.0),
    };
    drop(snap_tx);
    let _ = writer.join();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if keep_shm {
        info!("leaving shm_vip_{} in place", config.vip);
        drop(dp);
    } else {
        dp.destroy()?;
    }
    Ok(())
}
