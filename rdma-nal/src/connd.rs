//! Connect daemon
//!
//! Runs handshakes so that neither callers nor schedulers ever block on
//! one. The connect daemon makes active connects for peers queued by the
//! send path; the acceptor answers handshakes arriving from the fabric.
//!
//! Installing a connection closes any the peer left behind from an
//! earlier instance, told apart by the stamp in its handshake.

use crate::conn::{Conn, ConnParams};
use crate::error::NalError;
use crate::fabric::{FabricError, Hello, Incoming};
use crate::peer::Peer;
use crate::wire::MSG_VERSION;
use crate::{NalShared, Nid};
use crossbeam_channel::{select, Receiver};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

impl NalShared {
    fn hello_to(&self, dst: Nid, incarnation: u64) -> Hello {
        Hello {
            version: MSG_VERSION,
            src_nid: self.nid(),
            dst_nid: dst,
            incarnation,
            initial_seq: rand::random(),
            timeout_secs: self.config.timeout_secs,
            stamp: self.stamp,
        }
    }

    fn device_index(&self, dev: u32) -> Option<usize> {
        self.devices.iter().position(|d| d.id == dev)
    }

    fn conn_params(&self, ours: &Hello, theirs: &Hello, peer: Nid, dev_idx: usize) -> ConnParams {
        let timeout_secs = ours.timeout_secs.max(theirs.timeout_secs);
        ConnParams {
            peer_nid: peer,
            local_nid: self.nid(),
            incarnation: ours.incarnation,
            peer_stamp: theirs.stamp,
            dev_idx,
            keepalive: self.config.keepalive(),
            timeout: Duration::from_secs(timeout_secs as u64),
            tx_seq: ours.initial_seq,
            rx_seq: theirs.initial_seq,
        }
    }

    /// Active handshake with a peer that has descriptors waiting
    pub(crate) fn connect_peer(&self, nid: Nid) {
        let addr = {
            let table = self.table.read();
            match table.peers.get(&nid) {
                Some(peer) if peer.connecting => peer.addr.clone(),
                _ => {
                    debug!("Peer {:#x} no longer wants a connection", nid);
                    return;
                }
            }
        };

        let dev_idx = (nid % self.devices.len() as u64) as usize;
        let hello = self.hello_to(nid, rand::random());

        let result = addr
            .map_or_else(|| self.fabric.resolve(nid), Ok)
            .and_then(|addr| {
                debug!("Connecting to {:#x} at {}", nid, addr);
                self.fabric.connect(
                    self.devices[dev_idx].id,
                    &addr,
                    hello.clone(),
                    self.config.handshake_timeout(),
                )
            })
            .and_then(|(endpoint, reply)| {
                check_reply(&hello, &reply).map_err(|e| {
                    endpoint.close();
                    e
                })?;
                Ok((endpoint, reply))
            });

        match result {
            Ok((endpoint, reply)) => {
                let params = self.conn_params(&hello, &reply, nid, dev_idx);
                self.install_conn(Conn::new(params, endpoint), true);
            }
            Err(e) => self.connect_failed(nid, e),
        }
    }

    /// Passive handshake: adopt the initiator's incarnation and answer
    /// with our own initial sequence number
    pub(crate) fn accept_incoming(&self, incoming: Incoming) {
        let hello = incoming.hello.clone();
        if hello.version != MSG_VERSION || hello.dst_nid != self.nid() {
            warn!(
                "Rejecting connection from {:#x}: version {}, addressed to {:#x}",
                hello.src_nid, hello.version, hello.dst_nid
            );
            incoming.reject();
            return;
        }
        let Some(dev_idx) = self.device_index(incoming.endpoint.device()) else {
            warn!(
                "Rejecting connection from {:#x} on unmanaged device {}",
                hello.src_nid,
                incoming.endpoint.device()
            );
            incoming.reject();
            return;
        };

        let ours = self.hello_to(hello.src_nid, hello.incarnation);
        let endpoint = incoming.accept(ours.clone());
        let params = self.conn_params(&ours, &hello, hello.src_nid, dev_idx);
        self.install_conn(Conn::new(params, endpoint), false);
    }

    fn install_conn(&self, conn: Arc<Conn>, active: bool) {
        let nid = conn.peer_nid;
        let (installed, stale, failed) = {
            let mut table = self.table.write();
            let interval = self.config.min_reconnect_interval();
            if !active {
                table
                    .peers
                    .entry(nid)
                    .or_insert_with(|| Peer::new(nid, None, 0, interval));
            }
            if let Some(peer) = table.peers.get_mut(&nid) {
                if active {
                    peer.connecting = false;
                }
                peer.reconnect_interval = interval;
            }
            match table.install(&conn) {
                Ok(()) => {
                    let (stale, failed) = table.close_stale_conns(&conn);
                    (Ok(()), stale, failed)
                }
                Err(e) => (Err(e), Vec::new(), Vec::new()),
            }
        };

        self.fail_txs(failed, NalError::ConnectionClosed(nid));
        for old in &stale {
            self.schedule_conn(old);
        }

        match installed {
            Ok(()) => {
                info!(
                    "Connected to {:#x} ({}, cqid {}, incarnation {:#x})",
                    nid,
                    if active { "active" } else { "passive" },
                    conn.cqid(),
                    conn.incarnation
                );
                if self.reaper_tx.send(conn.timeout.min(conn.keepalive)).is_err() {
                    debug!("Reaper gone, not reporting timeout of {:#x}", nid);
                }
                self.schedule_conn(&conn);
            }
            Err(_) => {
                warn!("Peer {:#x} deleted while connecting", nid);
                conn.endpoint.close();
            }
        }
    }

    fn connect_failed(&self, nid: Nid, err: FabricError) {
        let failed = {
            let mut table = self.table.write();
            let Some(peer) = table.peers.get_mut(&nid) else {
                return;
            };
            peer.connecting = false;

            if !peer.conns.is_empty() {
                // A passive connection arrived meanwhile and took the queue
                Vec::new()
            } else {
                peer.backoff(self.config.max_reconnect_interval());
                warn!(
                    "Can't connect to {:#x}: {}; retry in {:?}",
                    nid, err, peer.reconnect_interval
                );
                let failed = peer.tx_queue.drain(..).collect::<Vec<_>>();
                table.unlink_if_unused(nid);
                failed
            }
        };
        self.fail_txs(failed, NalError::HostUnreachable(nid));
    }
}

fn check_reply(ours: &Hello, reply: &Hello) -> Result<(), FabricError> {
    if reply.version != MSG_VERSION
        || reply.src_nid != ours.dst_nid
        || reply.dst_nid != ours.src_nid
        || reply.incarnation != ours.incarnation
    {
        return Err(FabricError::ConnectFailed(format!(
            "unexpected handshake reply {:?}",
            reply
        )));
    }
    Ok(())
}

/// Active connects, one at a time; may block for a handshake timeout
pub(crate) fn run_connd(nal: Arc<NalShared>, peers: Receiver<Nid>, stop: Receiver<()>) {
    info!("Connection daemon started");

    loop {
        select! {
            recv(stop) -> _ => break,
            recv(peers) -> nid => match nid {
                Ok(nid) => nal.connect_peer(nid),
                Err(_) => break,
            },
        }
    }

    info!("Connection daemon stopped");
}

/// Passive accepts, on their own thread so an incoming handshake is
/// answered even while the connect daemon waits on an outgoing one
pub(crate) fn run_acceptor(nal: Arc<NalShared>, stop: Receiver<()>) {
    info!("Acceptor started");

    let incoming = nal.fabric.incoming();
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(incoming) -> inc => match inc {
                Ok(inc) => nal.accept_incoming(inc),
                Err(_) => {
                    debug!("Fabric stopped delivering connection requests");
                    let _ = stop.recv();
                    break;
                }
            },
        }
    }

    info!("Acceptor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Hello {
        Hello {
            version: MSG_VERSION,
            src_nid: 1,
            dst_nid: 2,
            incarnation: 0xabc,
            initial_seq: 10,
            timeout_secs: 30,
            stamp: 7,
        }
    }

    #[test]
    fn test_reply_must_echo_incarnation() {
        let ours = hello();
        let mut reply = Hello {
            src_nid: 2,
            dst_nid: 1,
            initial_seq: 99,
            ..hello()
        };
        assert!(check_reply(&ours, &reply).is_ok());

        reply.incarnation += 1;
        assert!(matches!(
            check_reply(&ours, &reply),
            Err(FabricError::ConnectFailed(_))
        ));
    }

    #[test]
    fn test_reply_from_wrong_node() {
        let ours = hello();
        let reply = Hello {
            src_nid: 3,
            dst_nid: 1,
            ..hello()
        };
        assert!(check_reply(&ours, &reply).is_err());
    }
}
