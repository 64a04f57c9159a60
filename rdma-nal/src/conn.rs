//! Connections
//!
//! A connection owns one fabric endpoint and three descriptor queues:
//! - fmaq: waiting to be sent as a short message
//! - rdmaq: RDMA posted, waiting for its completion
//! - replyq: sent, waiting for the peer's reply matched by cookie
//!
//! Queue contents and sequencing live under the connection lock. State
//! changes to CLOSING and CLOSED are only made while also holding the
//! connection table's write lock.

use crate::error::{NalError, Result};
use crate::fabric::{Endpoint, FmaSend};
use crate::tx::Tx;
use crate::wire::{Message, MsgBody, MsgType};
use crate::Nid;
use log::{trace, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Establishing,
    Active,
    Closing,
    Closed,
}

pub(crate) struct ConnInner {
    pub state: ConnState,
    pub fmaq: VecDeque<Box<Tx>>,
    pub rdmaq: VecDeque<Box<Tx>>,
    pub replyq: VecDeque<Box<Tx>>,
    pub last_tx: Instant,
    pub last_rx: Instant,
    pub tx_seq: u32,
    pub rx_seq: u32,
    pub close_sent: bool,
    pub close_recvd: bool,
    pub close_reason: Option<NalError>,
    pub protocol_errors: u32,
}

pub struct Conn {
    pub(crate) peer_nid: Nid,
    pub(crate) local_nid: Nid,
    pub(crate) incarnation: u64,
    /// Instance stamp the peer announced in its handshake
    pub(crate) peer_stamp: u64,
    pub(crate) endpoint: Arc<dyn Endpoint>,
    /// Index into the NAL's device list
    pub(crate) dev_idx: usize,
    pub(crate) keepalive: Duration,
    pub(crate) timeout: Duration,
    /// Set while on the device's schedule queue; changed under the device lock
    pub(crate) scheduled: AtomicBool,
    pub(crate) inner: Mutex<ConnInner>,
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub peer_nid: Nid,
    pub cqid: u32,
    pub incarnation: u64,
    pub state: ConnState,
    pub tx_seq: u32,
    pub rx_seq: u32,
    pub fmaq: usize,
    pub rdmaq: usize,
    pub replyq: usize,
}

pub(crate) struct ConnParams {
    pub peer_nid: Nid,
    pub local_nid: Nid,
    pub incarnation: u64,
    pub peer_stamp: u64,
    pub dev_idx: usize,
    pub keepalive: Duration,
    pub timeout: Duration,
    pub tx_seq: u32,
    pub rx_seq: u32,
}

impl Conn {
    pub(crate) fn new(params: ConnParams, endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            peer_nid: params.peer_nid,
            local_nid: params.local_nid,
            incarnation: params.incarnation,
            peer_stamp: params.peer_stamp,
            endpoint,
            dev_idx: params.dev_idx,
            keepalive: params.keepalive,
            timeout: params.timeout,
            scheduled: AtomicBool::new(false),
            inner: Mutex::new(ConnInner {
                state: ConnState::Establishing,
                fmaq: VecDeque::new(),
                rdmaq: VecDeque::new(),
                replyq: VecDeque::new(),
                last_tx: now,
                last_rx: now,
                tx_seq: params.tx_seq,
                rx_seq: params.rx_seq,
                close_sent: false,
                close_recvd: false,
                close_reason: None,
                protocol_errors: 0,
            }),
        })
    }

    pub fn cqid(&self) -> u32 {
        self.endpoint.cqid()
    }

    pub fn peer_nid(&self) -> Nid {
        self.peer_nid
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock()
    }

    pub fn info(&self) -> ConnInfo {
        let inner = self.inner.lock();
        ConnInfo {
            peer_nid: self.peer_nid,
            cqid: self.cqid(),
            incarnation: self.incarnation,
            state: inner.state,
            tx_seq: inner.tx_seq,
            rx_seq: inner.rx_seq,
            fmaq: inner.fmaq.len(),
            rdmaq: inner.rdmaq.len(),
            replyq: inner.replyq.len(),
        }
    }

    /// Queue a descriptor for sending; hands it back if the connection
    /// is no longer accepting work
    pub(crate) fn enqueue_fma(self: &Arc<Self>, mut tx: Box<Tx>) -> std::result::Result<(), Box<Tx>> {
        let mut inner = self.inner.lock();
        if inner.state != ConnState::Active {
            return Err(tx);
        }
        tx.conn = Some(self.clone());
        tx.qtime = Instant::now();
        inner.fmaq.push_back(tx);
        Ok(())
    }

    /// Remove the descriptor awaiting a reply with this cookie
    ///
    /// An entry whose type doesn't match the reply is logged and left in
    /// place; the reaper eventually times it out.
    pub(crate) fn match_reply(&self, expected: MsgType, cookie: u64) -> Option<Box<Tx>> {
        let mut inner = self.inner.lock();
        let pos = inner.replyq.iter().position(|tx| tx.cookie == cookie);
        let Some(pos) = pos else {
            warn!(
                "{:#x}: no descriptor awaiting {:?} reply with cookie {:#x}",
                self.peer_nid, expected, cookie
            );
            return None;
        };

        let actual = inner.replyq[pos].msg_type();
        if actual != Some(expected) {
            warn!(
                "{:#x}: cookie {:#x} belongs to {:?}, not {:?}",
                self.peer_nid, cookie, actual, expected
            );
            return None;
        }
        inner.replyq.remove(pos)
    }
}

impl ConnInner {
    /// Send one message with the next sequence number; caller holds the
    /// connection lock so sequence numbers go out in order
    pub fn sendmsg(&mut self, conn: &Conn, body: MsgBody) -> Result<FmaSend> {
        let fence = body.msg_type().is_fenced();
        let mut msg = Message::new(conn.local_nid, body);
        msg.incarnation = conn.incarnation;
        msg.seq = self.tx_seq;
        let bytes = msg.encode();

        match conn.endpoint.fma_send(&bytes, fence)? {
            FmaSend::Sent => {
                trace!(
                    "{:#x}: sent {:?} seq {}",
                    conn.peer_nid,
                    msg.msg_type(),
                    msg.seq
                );
                self.tx_seq = self.tx_seq.wrapping_add(1);
                self.last_tx = Instant::now();
                Ok(FmaSend::Sent)
            }
            FmaSend::NoCredits => Ok(FmaSend::NoCredits),
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnState::Closing | ConnState::Closed)
    }

    /// Drain the queues that fail immediately on close
    pub fn drain_unsent(&mut self) -> Vec<Box<Tx>> {
        self.fmaq.drain(..).chain(self.replyq.drain(..)).collect()
    }

    pub fn drain_all(&mut self) -> Vec<Box<Tx>> {
        let mut txs = self.drain_unsent();
        txs.extend(self.rdmaq.drain(..));
        txs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fabric::{FabricError, RdmaPost};
    use crate::tx::TxPool;

    /// Endpoint that accepts everything and records sends
    #[derive(Default)]
    pub(crate) struct NullEndpoint {
        pub cqid: u32,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub no_credits: AtomicBool,
    }

    impl NullEndpoint {
        pub fn with_cqid(cqid: u32) -> Self {
            Self {
                cqid,
                ..Default::default()
            }
        }
    }

    impl Endpoint for NullEndpoint {
        fn cqid(&self) -> u32 {
            self.cqid
        }

        fn device(&self) -> u32 {
            0
        }

        fn fma_send(&self, msg: &[u8], _fence: bool) -> std::result::Result<FmaSend, FabricError> {
            if self.no_credits.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(FmaSend::NoCredits);
            }
            self.sent.lock().push(msg.to_vec());
            Ok(FmaSend::Sent)
        }

        fn fma_recv(&self) -> Option<Vec<u8>> {
            None
        }

        fn post_rdma(&self, _post: RdmaPost) -> std::result::Result<(), FabricError> {
            Ok(())
        }

        fn rdma_done(&self) -> Option<u64> {
            None
        }

        fn close(&self) {}
    }

    pub(crate) fn test_conn(endpoint: Arc<dyn Endpoint>) -> Arc<Conn> {
        Conn::new(
            ConnParams {
                peer_nid: 2,
                local_nid: 1,
                incarnation: 99,
                peer_stamp: 1,
                dev_idx: 0,
                keepalive: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
                tx_seq: 100,
                rx_seq: 200,
            },
            endpoint,
        )
    }

    #[test]
    fn test_sendmsg_sequences_messages() {
        let ep = Arc::new(NullEndpoint::default());
        let conn = test_conn(ep.clone());

        let mut inner = conn.lock();
        inner.sendmsg(&conn, MsgBody::Noop).unwrap();
        inner.sendmsg(&conn, MsgBody::Close).unwrap();
        assert_eq!(inner.tx_seq, 102);
        drop(inner);

        let sent = ep.sent.lock();
        let first = Message::decode(&sent[0]).unwrap();
        let second = Message::decode(&sent[1]).unwrap();
        assert_eq!((first.seq, first.incarnation, first.src_nid), (100, 99, 1));
        assert_eq!(second.seq, 101);
        assert_eq!(second.body, MsgBody::Close);
    }

    #[test]
    fn test_sendmsg_without_credits_keeps_sequence() {
        let ep = Arc::new(NullEndpoint::default());
        ep.no_credits.store(true, std::sync::atomic::Ordering::SeqCst);
        let conn = test_conn(ep.clone());

        let mut inner = conn.lock();
        assert_eq!(inner.sendmsg(&conn, MsgBody::Noop).unwrap(), FmaSend::NoCredits);
        assert_eq!(inner.tx_seq, 100);
    }

    #[test]
    fn test_enqueue_requires_active() {
        let pool = TxPool::new(1, 0);
        let conn = test_conn(Arc::new(NullEndpoint::default()));

        let tx = pool.acquire(true).unwrap();
        let tx = conn.enqueue_fma(tx).unwrap_err();
        conn.lock().state = ConnState::Active;
        conn.enqueue_fma(tx).unwrap();
        assert_eq!(conn.info().fmaq, 1);

        let tx = conn.lock().fmaq.pop_front().unwrap();
        pool.release(tx).unwrap();
    }

    #[test]
    fn test_reply_type_mismatch_left_queued() {
        let pool = TxPool::new(2, 0);
        let conn = test_conn(Arc::new(NullEndpoint::default()));

        let mut tx = pool.acquire(true).unwrap();
        tx.msg = Some(MsgBody::GetReq {
            hdr: vec![],
            cookie: tx.cookie,
            desc: Default::default(),
        });
        let cookie = tx.cookie;
        conn.lock().replyq.push_back(tx);

        assert!(conn.match_reply(MsgType::PutReq, cookie).is_none());
        assert_eq!(conn.info().replyq, 1);
        assert!(conn.match_reply(MsgType::GetReq, cookie + 1000).is_none());

        let tx = conn.match_reply(MsgType::GetReq, cookie).unwrap();
        assert_eq!(tx.cookie(), cookie);
        assert_eq!(conn.info().replyq, 0);
        pool.release(tx).unwrap();
    }
}
