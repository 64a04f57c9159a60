//! NAL node daemon
//!
//! Starts a TCP fabric and a NAL instance, then pings every configured
//! peer with a 64-byte IMMEDIATE message until interrupted.

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, select, tick};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rdma_nal::fabric::tcp::{TcpFabric, TcpFabricConfig};
use rdma_nal::{Completion, Iov, Matched, Nal, NalConfig, Nid, Payload, Segment, SendRequest, Upper};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PING_HDR: &[u8] = b"ping";
const PING_SIZE: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NodeConfig {
    nal: NalConfig,
    /// Listen address of the TCP fabric
    listen: String,
    /// Peers to ping, by node id
    peers: HashMap<Nid, String>,
    ping_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nal: NalConfig::default(),
            listen: TcpFabricConfig::default().listen,
            peers: HashMap::new(),
            ping_interval_secs: 5,
        }
    }
}

#[derive(Default)]
struct Stats {
    sent: AtomicU64,
    failed: AtomicU64,
    received: Mutex<HashMap<Nid, u64>>,
}

/// Accepts pings; refuses bulk transfers
struct PingUpper {
    stats: Arc<Stats>,
}

impl Upper for PingUpper {
    fn recv_immediate(&self, src: Nid, hdr: &[u8], payload: &[u8]) {
        if hdr != PING_HDR {
            warn!("Unexpected message from {:#x} ({} byte header)", src, hdr.len());
            return;
        }
        let seq = payload
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or_default();
        debug!("Ping {} from {:#x}", seq, src);
        *self.stats.received.lock().entry(src).or_default() += 1;
    }

    fn match_put(&self, src: Nid, _hdr: &[u8]) -> Option<Matched> {
        debug!("Refusing PUT from {:#x}", src);
        None
    }

    fn match_get(&self, src: Nid, _hdr: &[u8], _sink_len: usize) -> Option<Matched> {
        debug!("Refusing GET from {:#x}", src);
        None
    }
}

fn load_config() -> Result<NodeConfig> {
    let Some(path) = std::env::args().nth(1) else {
        bail!("Usage: nal-node <config.json>");
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    let config: NodeConfig =
        serde_json::from_str(&text).with_context(|| format!("Invalid config in {}", path))?;
    config.nal.validate().context("Invalid NAL configuration")?;
    if config.ping_interval_secs == 0 {
        bail!("ping_interval_secs must be non-zero");
    }
    Ok(config)
}

fn ping(nal: &Nal, nid: Nid, seq: u64, stats: &Arc<Stats>) {
    let mut data = vec![0u8; PING_SIZE];
    data[..8].copy_from_slice(&seq.to_be_bytes());
    let payload = Payload::Iov(vec![Iov::whole(Segment::from_vec(data))]);
    let req = SendRequest::new(nid, PING_HDR.to_vec()).with_payload(payload, 0, PING_SIZE);

    let done = stats.clone();
    let completion = Completion::new(move |status| match status {
        Ok(()) => {
            done.sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            done.failed.fetch_add(1, Ordering::Relaxed);
            debug!("Ping {} to {:#x} failed: {}", seq, nid, e);
        }
    });

    if let Err(e) = nal.send(req, completion) {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!("Can't ping {:#x}: {}", nid, e);
    }
}

fn report(nal: &Nal, peers: &[Nid], stats: &Stats) {
    let (idle, idle_nblk) = nal.idle_descriptors();
    info!(
        "Pings sent {}, failed {}; idle descriptors {}+{}",
        stats.sent.load(Ordering::Relaxed),
        stats.failed.load(Ordering::Relaxed),
        idle,
        idle_nblk
    );
    let received = stats.received.lock().clone();
    for &nid in peers {
        let conns = nal.conn_info(nid);
        info!(
            "  {:#x}: {} received, {} connection(s) {:?}",
            nid,
            received.get(&nid).copied().unwrap_or_default(),
            conns.len(),
            conns.iter().map(|c| c.state).collect::<Vec<_>>()
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = load_config()?;
    let nid = config.nal.nid;
    info!("NAL node {:#x} starting", nid);

    let fabric = Arc::new(TcpFabric::new(TcpFabricConfig {
        nid,
        listen: config.listen.clone(),
        peers: config.peers.clone(),
        ..Default::default()
    })?);
    info!("Reachable at {}", fabric.local_addr());

    let stats = Arc::new(Stats::default());
    let upper = Arc::new(PingUpper {
        stats: stats.clone(),
    });
    let mut nal = Nal::startup(config.nal, fabric, upper).context("Failed to start NAL")?;

    let mut peers = config.peers.into_iter().collect::<Vec<_>>();
    peers.sort();
    for (peer, addr) in &peers {
        nal.add_peer(*peer, Some(addr.clone()));
    }
    let peers = peers.into_iter().map(|(peer, _)| peer).collect::<Vec<_>>();

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Pinging {} peer(s); press Ctrl+C to exit", peers.len());
    let ticker = tick(Duration::from_secs(config.ping_interval_secs));
    let mut seq = 0u64;
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                for &peer in &peers {
                    ping(&nal, peer, seq, &stats);
                }
                seq += 1;
                report(&nal, &peers, &stats);
            }
        }
    }

    info!("Shutting down node {:#x}", nid);
    nal.shutdown();
    report(&nal, &peers, &stats);
    Ok(())
}
