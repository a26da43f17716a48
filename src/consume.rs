//! `flowplane consume` — reference implementation of the out-of-band
//! weight consumer.
//!
//! Attaches to the VIP's shared region from the consumer side, accepts each
//! newly sealed telemetry frame, scores the active backends from their
//! counter movement, and writes back a sealed alias-table frame the data
//! plane picks up on its next tick. Production deployments replace the
//! scoring with something smarter; the ring discipline stays the same.

use anyhow::Result;
use flow_dataplane::{alias, AliasEntry, ConsumerEndpoint, MsgOut, AS_MAX};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::FlowplaneConfig;

#[derive(Serialize)]
struct ConsumeLine {
    wall: String,
    frame_id: u32,
    frame_ts: f32,
    active: u32,
    /// (backend, score) for active backends.
    scores: Vec<(u32, f32)>,
}

/// Score each active backend from the latest frame.
///
/// Lightweight inverse-pressure heuristic: established flows plus a penalty
/// for retransmissions since the previous frame. Inactive backends score 0
/// and end up with zero weight.
fn score_backends(frame: &MsgOut, prev: Option<&MsgOut>) -> [f32; AS_MAX] {
    let mut scores = [0.0f32; AS_MAX];
    for i in 0..AS_MAX {
        if frame.active & (1u64 << i) == 0 {
            continue;
        }
        let s = &frame.body[i];
        let d_rtr = match prev {
            Some(p) => s.n_rtr.wrapping_sub(p.body[i].n_rtr),
            None => 0,
        };
        let pressure = s.n_flow_on.max(0) as f32 + 4.0 * d_rtr as f32;
        scores[i] = 1.0 / (1.0 + pressure);
    }
    scores
}

pub fn run(config: &FlowplaneConfig, interval: f64, count: Option<u64>) -> Result<()> {
    let mut endpoint = ConsumerEndpoint::attach(config.vip, config.dataplane.shm_size)?;
    info!(
        "consume — attached to shm_vip_{}, updating every {interval}s",
        config.vip
    );

    let mut prev: Option<MsgOut> = None;
    let mut updates = 0u64;
    loop {
        std::thread::sleep(Duration::from_secs_f64(interval));
        let Some(frame) = endpoint.read_latest() else {
            debug!("no new telemetry frame this tick");
            continue;
        };

        let scores = score_backends(&frame, prev.as_ref());
        let table: [AliasEntry; AS_MAX] = alias::build(&scores);
        endpoint.write_weights(frame.ts, scores, table);

        let line = ConsumeLine {
            wall: chrono::Utc::now().to_rfc3339(),
            frame_id: frame.id,
            frame_ts: frame.ts,
            active: frame.active.count_ones(),
            scores: (0..AS_MAX as u32)
                .filter(|&i| frame.active & (1u64 << i) != 0)
                .map(|i| (i, scores[i as usize]))
                .collect(),
        };
        println!("{}", serde_json::to_string(&line)?);

        prev = Some(frame);
        updates += 1;
        if count.is_some_and(|c| updates >= c) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_favor_idle_backends() {
        let mut frame = MsgOut::default();
        frame.active = 0b11;
        frame.body[0].n_flow_on = 0;
        frame.body[1].n_flow_on = 9;
        let scores = score_backends(&frame, None);
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[1], 0.1);
        assert_eq!(scores[2], 0.0, "inactive backend must score zero");
    }

    #[test]
    fn test_retransmissions_penalised_via_delta() {
        let mut prev = MsgOut::default();
        prev.active = 0b1;
        prev.body[0].n_rtr = 10;
        let mut frame = prev;
        frame.body[0].n_rtr = 15;
        let scores = score_backends(&frame, Some(&prev));
        // pressure = 0 flows + 4 * 5 rtr = 20.
        assert!((scores[0] - 1.0 / 21.0).abs() < 1e-6);
        // Without history the same frame scores on flows alone.
        let fresh = score_backends(&frame, None);
        assert_eq!(fresh[0], 1.0);
    }
}
