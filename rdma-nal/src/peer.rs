//! Peer and connection table
//!
//! Peers are keyed by node id; established connections are additionally
//! indexed by completion queue id so fabric events can find them. Lock
//! order is table, then connection, then pool. The device schedule lock
//! is never held while taking the table lock.

use crate::conn::{Conn, ConnInfo, ConnState};
use crate::error::NalError;
use crate::tx::Tx;
use crate::Nid;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct Peer {
    pub nid: Nid,
    /// Transport address; resolved through the fabric when unset
    pub addr: Option<String>,
    /// Zero for peers that exist only while connected
    pub persistence: u32,
    pub connecting: bool,
    /// No connection attempt before this instant
    pub reconnect_time: Option<Instant>,
    pub reconnect_interval: Duration,
    /// Descriptors waiting for a connection
    pub tx_queue: VecDeque<Box<Tx>>,
    pub conns: Vec<Arc<Conn>>,
}

impl Peer {
    pub fn new(nid: Nid, addr: Option<String>, persistence: u32, interval: Duration) -> Self {
        Self {
            nid,
            addr,
            persistence,
            connecting: false,
            reconnect_time: None,
            reconnect_interval: interval,
            tx_queue: VecDeque::new(),
            conns: Vec::new(),
        }
    }

    /// Nothing keeps an unpersisted peer alive
    fn is_unused(&self) -> bool {
        self.persistence == 0 && self.conns.is_empty() && !self.connecting && self.tx_queue.is_empty()
    }

    /// Record a failed connection attempt
    pub fn backoff(&mut self, max: Duration) {
        self.reconnect_time = Some(Instant::now() + self.reconnect_interval);
        self.reconnect_interval = (self.reconnect_interval * 2).min(max);
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        matches!(self.reconnect_time, Some(t) if now < t)
    }
}

/// Snapshot of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub nid: Nid,
    pub addr: Option<String>,
    pub persistence: u32,
    pub connecting: bool,
    pub queued: usize,
    pub conns: Vec<ConnInfo>,
}

#[derive(Default)]
pub(crate) struct TableInner {
    pub peers: HashMap<Nid, Peer>,
    pub conns: HashMap<u32, Arc<Conn>>,
}

#[derive(Default)]
pub(crate) struct ConnTable {
    inner: RwLock<TableInner>,
}

impl ConnTable {
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, TableInner> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, TableInner> {
        self.inner.write()
    }
}

impl TableInner {
    /// First usable connection to `nid`
    pub fn find_conn(&self, nid: Nid) -> Option<Arc<Conn>> {
        self.peers
            .get(&nid)?
            .conns
            .iter()
            .find(|c| c.state() == ConnState::Active)
            .cloned()
    }

    pub fn conn_by_cqid(&self, cqid: u32) -> Option<Arc<Conn>> {
        self.conns.get(&cqid).cloned()
    }

    /// Conns on one device
    pub fn conns_on(&self, dev_idx: usize) -> Vec<Arc<Conn>> {
        self.conns
            .values()
            .filter(|c| c.dev_idx == dev_idx)
            .cloned()
            .collect()
    }

    /// Add a peer or raise the persistence of an existing one
    pub fn add_peer(&mut self, nid: Nid, addr: Option<String>, interval: Duration) {
        let peer = self
            .peers
            .entry(nid)
            .or_insert_with(|| Peer::new(nid, None, 0, interval));
        peer.persistence += 1;
        if addr.is_some() {
            peer.addr = addr;
        }
    }

    /// Make an established connection visible; queued descriptors move
    /// onto its fmaq in order
    pub fn install(&mut self, conn: &Arc<Conn>) -> Result<(), NalError> {
        let Some(peer) = self.peers.get_mut(&conn.peer_nid) else {
            return Err(NalError::ConnectionClosed(conn.peer_nid));
        };

        {
            let mut inner = conn.lock();
            inner.state = ConnState::Active;
            let now = Instant::now();
            for mut tx in peer.tx_queue.drain(..) {
                tx.conn = Some(conn.clone());
                tx.qtime = now;
                inner.fmaq.push_back(tx);
            }
        }

        peer.reconnect_time = None;
        peer.conns.push(conn.clone());
        self.conns.insert(conn.cqid(), conn.clone());
        Ok(())
    }

    /// Close connections left over from an earlier instance of the peer
    /// `conn` leads to; returns them with the descriptors that fail now
    pub fn close_stale_conns(&mut self, conn: &Arc<Conn>) -> (Vec<Arc<Conn>>, Vec<Box<Tx>>) {
        let stale = match self.peers.get(&conn.peer_nid) {
            Some(peer) => peer
                .conns
                .iter()
                .filter(|c| c.peer_stamp != conn.peer_stamp)
                .cloned()
                .collect::<Vec<_>>(),
            None => return (Vec::new(), Vec::new()),
        };

        let mut failed = Vec::new();
        for old in &stale {
            warn!(
                "Closing stale connection to {:#x}: peer stamp {:#x}, now {:#x}",
                conn.peer_nid, old.peer_stamp, conn.peer_stamp
            );
            failed.extend(self.close_conn(old, NalError::ConnectionClosed(conn.peer_nid)));
        }
        (stale, failed)
    }

    pub fn unlink_if_unused(&mut self, nid: Nid) {
        if self.peers.get(&nid).is_some_and(Peer::is_unused) {
            debug!("Unlinking peer {:#x}", nid);
            self.peers.remove(&nid);
        }
    }

    /// Start closing a connection; returns the descriptors that fail now
    ///
    /// Outstanding RDMA stays queued until its completion arrives.
    pub fn close_conn(&mut self, conn: &Arc<Conn>, reason: NalError) -> Vec<Box<Tx>> {
        let failed = {
            let mut inner = conn.lock();
            if inner.is_closing() {
                return Vec::new();
            }
            info!("Closing connection to {:#x}: {}", conn.peer_nid, reason);
            inner.state = ConnState::Closing;
            inner.last_rx = Instant::now();
            inner.close_reason = Some(reason);
            inner.drain_unsent()
        };

        if let Some(peer) = self.peers.get_mut(&conn.peer_nid) {
            peer.conns.retain(|c| !Arc::ptr_eq(c, conn));
        }
        self.unlink_if_unused(conn.peer_nid);
        failed
    }

    /// Finish a connection; returns everything still queued on it
    pub fn terminate_conn(&mut self, conn: &Arc<Conn>) -> Vec<Box<Tx>> {
        let failed = {
            let mut inner = conn.lock();
            if inner.state == ConnState::Closed {
                return Vec::new();
            }
            if inner.close_reason.is_none() {
                inner.close_reason = Some(NalError::ConnectionClosed(conn.peer_nid));
            }
            inner.state = ConnState::Closed;
            inner.drain_all()
        };

        debug!("Terminated connection to {:#x} cqid {}", conn.peer_nid, conn.cqid());
        if let Some(c) = self.conns.get(&conn.cqid()) {
            if Arc::ptr_eq(c, conn) {
                self.conns.remove(&conn.cqid());
            }
        }
        if let Some(peer) = self.peers.get_mut(&conn.peer_nid) {
            peer.conns.retain(|c| !Arc::ptr_eq(c, conn));
        }
        self.unlink_if_unused(conn.peer_nid);
        conn.endpoint.close();
        failed
    }

    /// Drop a peer's persistence and close its connections; returns the
    /// descriptors that fail now and the reason to fail them with
    pub fn del_peer(&mut self, nid: Nid) -> Option<Vec<Box<Tx>>> {
        let peer = self.peers.get_mut(&nid)?;
        peer.persistence = 0;
        let conns = peer.conns.clone();
        let mut failed: Vec<Box<Tx>> = if peer.connecting {
            Vec::new()
        } else {
            peer.tx_queue.drain(..).collect()
        };

        for conn in &conns {
            failed.extend(self.close_conn(conn, NalError::ConnectionClosed(nid)));
        }
        self.unlink_if_unused(nid);
        Some(failed)
    }

    pub fn peer_info(&self, nid: Nid) -> Option<PeerInfo> {
        self.peers.get(&nid).map(|p| PeerInfo {
            nid: p.nid,
            addr: p.addr.clone(),
            persistence: p.persistence,
            connecting: p.connecting,
            queued: p.tx_queue.len(),
            conns: p.conns.iter().map(|c| c.info()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{test_conn, NullEndpoint};
    use crate::conn::ConnParams;
    use crate::tx::TxPool;
    use crate::wire::MsgBody;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn active_conn(table: &mut TableInner) -> Arc<Conn> {
        let conn = test_conn(Arc::new(NullEndpoint::default()));
        table.peers.insert(2, Peer::new(2, None, 0, INTERVAL));
        table.install(&conn).unwrap();
        conn
    }

    #[test]
    fn test_backoff_doubles_to_max() {
        let mut peer = Peer::new(1, None, 1, Duration::from_secs(1));
        peer.backoff(Duration::from_secs(3));
        assert!(peer.in_backoff(Instant::now()));
        assert_eq!(peer.reconnect_interval, Duration::from_secs(2));
        peer.backoff(Duration::from_secs(3));
        assert_eq!(peer.reconnect_interval, Duration::from_secs(3));
        peer.backoff(Duration::from_secs(3));
        assert_eq!(peer.reconnect_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_add_peer_accumulates_persistence() {
        let mut table = TableInner::default();
        table.add_peer(5, None, INTERVAL);
        table.add_peer(5, Some("10.0.0.5:988".to_string()), INTERVAL);
        let info = table.peer_info(5).unwrap();
        assert_eq!(info.persistence, 2);
        assert_eq!(info.addr.as_deref(), Some("10.0.0.5:988"));
    }

    #[test]
    fn test_install_moves_queued_descriptors() {
        let pool = TxPool::new(4, 0);
        let mut table = TableInner::default();
        let mut peer = Peer::new(2, None, 1, INTERVAL);
        for _ in 0..3 {
            let mut tx = pool.acquire(true).unwrap();
            tx.msg = Some(MsgBody::Noop);
            peer.tx_queue.push_back(tx);
        }
        table.peers.insert(2, peer);

        let conn = test_conn(Arc::new(NullEndpoint::default()));
        table.install(&conn).unwrap();

        assert_eq!(conn.state(), ConnState::Active);
        assert_eq!(conn.info().fmaq, 3);
        assert!(Arc::ptr_eq(&table.find_conn(2).unwrap(), &conn));
        assert!(table.conn_by_cqid(conn.cqid()).is_some());
    }

    #[test]
    fn test_close_keeps_rdmaq_until_terminate() {
        let pool = TxPool::new(4, 0);
        let mut table = TableInner::default();
        let conn = active_conn(&mut table);

        {
            let mut inner = conn.lock();
            inner.fmaq.push_back(pool.acquire(true).unwrap());
            inner.replyq.push_back(pool.acquire(true).unwrap());
            inner.rdmaq.push_back(pool.acquire(true).unwrap());
        }

        let failed = table.close_conn(&conn, NalError::Timeout);
        assert_eq!(failed.len(), 2);
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(conn.info().rdmaq, 1);
        assert!(table.find_conn(2).is_none());
        // Unpersisted peer with no conns is gone, the conn is still indexed
        assert!(table.peers.is_empty());
        assert!(table.conn_by_cqid(conn.cqid()).is_some());

        // Closing twice fails nothing more
        assert!(table.close_conn(&conn, NalError::Timeout).is_empty());

        let rest = table.terminate_conn(&conn);
        assert_eq!(rest.len(), 1);
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(table.conn_by_cqid(conn.cqid()).is_none());

        for tx in failed.into_iter().chain(rest) {
            pool.release(tx).unwrap();
        }
    }

    fn conn_from(stamp: u64, cqid: u32) -> Arc<Conn> {
        Conn::new(
            ConnParams {
                peer_nid: 2,
                local_nid: 1,
                incarnation: stamp * 10,
                peer_stamp: stamp,
                dev_idx: 0,
                keepalive: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
                tx_seq: 0,
                rx_seq: 0,
            },
            Arc::new(NullEndpoint::with_cqid(cqid)),
        )
    }

    #[test]
    fn test_restarted_peer_replaces_stale_conn() {
        let pool = TxPool::new(2, 0);
        let mut table = TableInner::default();
        table.peers.insert(2, Peer::new(2, None, 0, INTERVAL));

        let old = conn_from(1, 10);
        table.install(&old).unwrap();
        old.lock().fmaq.push_back(pool.acquire(true).unwrap());

        let new = conn_from(2, 11);
        table.install(&new).unwrap();
        let (stale, failed) = table.close_stale_conns(&new);

        assert_eq!(stale.len(), 1);
        assert!(Arc::ptr_eq(&stale[0], &old));
        assert_eq!(old.state(), ConnState::Closing);
        assert_eq!(failed.len(), 1);
        assert!(Arc::ptr_eq(&table.find_conn(2).unwrap(), &new));
        // The new conn keeps the passive peer alive
        assert_eq!(table.peer_info(2).unwrap().conns.len(), 1);

        for tx in failed {
            pool.release(tx).unwrap();
        }
    }

    #[test]
    fn test_same_instance_conns_coexist() {
        let mut table = TableInner::default();
        table.peers.insert(2, Peer::new(2, None, 1, INTERVAL));

        let active = conn_from(3, 20);
        let passive = conn_from(3, 21);
        table.install(&active).unwrap();
        table.install(&passive).unwrap();

        let (stale, failed) = table.close_stale_conns(&passive);
        assert!(stale.is_empty() && failed.is_empty());
        assert_eq!(active.state(), ConnState::Active);
        assert_eq!(table.peer_info(2).unwrap().conns.len(), 2);
    }

    #[test]
    fn test_del_peer_fails_queue() {
        let pool = TxPool::new(1, 0);
        let mut table = TableInner::default();
        table.add_peer(9, None, INTERVAL);
        table
            .peers
            .get_mut(&9)
            .unwrap()
            .tx_queue
            .push_back(pool.acquire(true).unwrap());

        let failed = table.del_peer(9).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(table.peers.is_empty());
        assert!(table.del_peer(9).is_none());
        pool.release(failed.into_iter().next().unwrap()).unwrap();
    }
}
