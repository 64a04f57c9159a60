//! Inbound message handling
//!
//! One message per call: decode, validate against the connection, then
//! act on it. Replies are matched to the reply queue by cookie.

use crate::buffer::Buffer;
use crate::conn::{Conn, ConnState};
use crate::error::NalError;
use crate::fabric::RdmaPost;
use crate::tx::Tx;
use crate::upper::Matched;
use crate::wire::{Message, MsgBody, MsgType, RdmaDesc, WireError};
use crate::NalShared;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Instant;

impl NalShared {
    /// Handle the next inbound message; true if one was consumed
    pub(crate) fn process_receives(&self, conn: &Arc<Conn>) -> bool {
        if conn.state() == ConnState::Closed {
            return false;
        }
        let Some(bytes) = conn.endpoint.fma_recv() else {
            return false;
        };

        // The sender consumed a sequence number even if this message turns
        // out to be bad
        let seq = {
            let mut inner = conn.lock();
            inner.last_rx = Instant::now();
            let seq = inner.rx_seq;
            inner.rx_seq = seq.wrapping_add(1);
            seq
        };

        let msg = match Message::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                self.protocol_error(conn, e);
                return true;
            }
        };
        if let Err(e) = msg.check(conn.peer_nid, conn.incarnation, seq) {
            self.protocol_error(conn, e);
            return true;
        }
        conn.lock().protocol_errors = 0;

        trace!("{:#x}: received {:?} seq {}", conn.peer_nid, msg.msg_type(), seq);

        if msg.msg_type().is_fenced() {
            conn.endpoint.fence_wait();
        }

        if msg.body == MsgBody::Close {
            self.handle_close(conn);
            return true;
        }

        if conn.lock().is_closing() {
            debug!(
                "{:#x}: dropping {:?} on closing connection",
                conn.peer_nid,
                msg.msg_type()
            );
            return true;
        }

        self.handle_message(conn, msg.body);
        true
    }

    fn protocol_error(&self, conn: &Arc<Conn>, e: WireError) {
        error!("Protocol error from {:#x}: {}", conn.peer_nid, e);
        let fail = {
            let mut inner = conn.lock();
            inner.protocol_errors += 1;
            e.is_fatal() || inner.protocol_errors >= self.config.max_protocol_errors
        };
        if fail {
            self.close_conn(conn, e.into());
        }
    }

    fn handle_close(&self, conn: &Arc<Conn>) {
        let (closing, close_sent) = {
            let mut inner = conn.lock();
            if inner.close_recvd {
                warn!("{:#x}: duplicate CLOSE", conn.peer_nid);
            }
            inner.close_recvd = true;
            (inner.is_closing(), inner.close_sent)
        };

        if !closing {
            info!("{:#x} closed the connection", conn.peer_nid);
            self.close_conn(conn, NalError::Timeout);
        } else if close_sent {
            self.terminate_conn(conn);
        }
    }

    fn handle_message(&self, conn: &Arc<Conn>, body: MsgBody) {
        let nid = conn.peer_nid;
        match body {
            MsgBody::Noop | MsgBody::Close => {}

            MsgBody::Immediate { hdr, payload } => {
                self.upper.recv_immediate(nid, &hdr, &payload);
            }

            MsgBody::PutReq { hdr, cookie } => match self.upper.match_put(nid, &hdr) {
                Some(sink) => self.accept_put(conn, cookie, sink),
                None => self.reply_nak(conn, MsgBody::PutNak { cookie }),
            },

            MsgBody::PutNak { cookie } => {
                if let Some(tx) = conn.match_reply(MsgType::PutReq, cookie) {
                    self.tx_done(tx, Err(NalError::NoMatch));
                }
            }

            MsgBody::PutAck {
                src_cookie,
                dst_cookie,
                desc,
            } => {
                if let Some(tx) = conn.match_reply(MsgType::PutReq, src_cookie) {
                    let nob = tx.buffer.nob().min(desc.nob as usize);
                    self.rdma(conn, tx, MsgBody::PutDone { cookie: dst_cookie }, desc, nob);
                }
            }

            MsgBody::PutDone { cookie } => {
                if let Some(tx) = conn.match_reply(MsgType::PutAck, cookie) {
                    self.tx_done(tx, Ok(()));
                }
            }

            MsgBody::GetReq { hdr, cookie, desc } => {
                match self.upper.match_get(nid, &hdr, desc.nob as usize) {
                    Some(source) => self.reply_get(conn, cookie, desc, source),
                    None => self.reply_nak(conn, MsgBody::GetNak { cookie }),
                }
            }

            MsgBody::GetNak { cookie } => {
                if let Some(tx) = conn.match_reply(MsgType::GetReq, cookie) {
                    self.tx_done(tx, Err(NalError::NoMatch));
                }
            }

            MsgBody::GetDone { cookie } => {
                if let Some(tx) = conn.match_reply(MsgType::GetReq, cookie) {
                    self.tx_done(tx, Ok(()));
                }
            }
        }
    }

    /// Bind and register the upper layer's sink, then advertise it
    fn accept_put(&self, conn: &Arc<Conn>, cookie: u64, sink: Matched) {
        let mut tx = match self.pool.acquire(false) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("{:#x}: can't accept PUT: {}", conn.peer_nid, e);
                sink.completion.fire(Err(e));
                return;
            }
        };

        match self.bind_matched(conn, &sink) {
            Ok(buffer) => {
                let desc = buffer.desc().unwrap_or_default();
                tx.buffer = buffer;
                tx.msg = Some(MsgBody::PutAck {
                    src_cookie: cookie,
                    dst_cookie: tx.cookie,
                    desc,
                });
                tx.completions[0] = Some(sink.completion);
            }
            Err(e) => {
                error!("{:#x}: can't set up PUT sink: {}", conn.peer_nid, e);
                sink.completion.fire(Err(e));
                tx.msg = Some(MsgBody::PutNak { cookie });
            }
        }
        self.post_fma(conn, tx);
    }

    /// Move the matched source into the initiator's advertised sink
    fn reply_get(&self, conn: &Arc<Conn>, cookie: u64, desc: RdmaDesc, source: Matched) {
        if source.len > desc.nob as usize {
            warn!(
                "{:#x}: GET source {} bytes exceeds sink {}",
                conn.peer_nid, source.len, desc.nob
            );
            source.completion.fire(Err(NalError::MessageTooLarge {
                size: source.len,
                max: desc.nob as usize,
            }));
            self.reply_nak(conn, MsgBody::GetNak { cookie });
            return;
        }

        let mut tx = match self.pool.acquire(false) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("{:#x}: can't reply to GET: {}", conn.peer_nid, e);
                source.completion.fire(Err(e));
                return;
            }
        };

        match self.bind_matched(conn, &source) {
            Ok(buffer) => {
                let nob = buffer.nob();
                tx.buffer = buffer;
                tx.completions[0] = Some(source.completion);
                self.rdma(conn, tx, MsgBody::GetDone { cookie }, desc, nob);
            }
            Err(e) => {
                error!("{:#x}: can't set up GET source: {}", conn.peer_nid, e);
                source.completion.fire(Err(e));
                tx.msg = Some(MsgBody::GetNak { cookie });
                self.post_fma(conn, tx);
            }
        }
    }

    fn bind_matched(&self, conn: &Conn, m: &Matched) -> crate::Result<Buffer> {
        let mut buffer = Buffer::setup(&m.payload, m.offset, m.len, self.config.max_phys_regions)?;
        buffer.map(self.fabric.as_ref(), self.devices[conn.dev_idx].id)?;
        Ok(buffer)
    }

    fn reply_nak(&self, conn: &Arc<Conn>, body: MsgBody) {
        match self.pool.acquire(false) {
            Ok(mut tx) => {
                tx.msg = Some(body);
                self.post_fma(conn, tx);
            }
            Err(e) => warn!("{:#x}: can't send {:?}: {}", conn.peer_nid, body.msg_type(), e),
        }
    }

    /// Write `nob` bytes of the descriptor's buffer into `desc`, then
    /// send `done` once the transfer completes
    pub(crate) fn rdma(&self, conn: &Arc<Conn>, mut tx: Box<Tx>, done: MsgBody, desc: RdmaDesc, nob: usize) {
        tx.msg = Some(done);
        if nob == 0 {
            self.post_fma(conn, tx);
            return;
        }

        let Some(src) = tx.buffer.desc() else {
            error!("{:#x}: RDMA source for {:#x} not registered", conn.peer_nid, tx.cookie);
            self.tx_done(tx, Err(NalError::Protocol("RDMA source not registered".into())));
            return;
        };
        let post = RdmaPost {
            app_id: tx.cookie,
            src_key: src.key,
            src_addr: src.addr,
            dst: desc,
            nob,
        };

        let mut inner = conn.lock();
        if inner.is_closing() {
            let reason = inner
                .close_reason
                .clone()
                .unwrap_or(NalError::ConnectionClosed(conn.peer_nid));
            drop(inner);
            self.tx_done(tx, Err(reason));
            return;
        }

        tx.conn = Some(conn.clone());
        tx.qtime = Instant::now();
        inner.rdmaq.push_back(tx);

        // Posted under the connection lock so its completion can't be
        // processed before the descriptor is on rdmaq
        if let Err(e) = conn.endpoint.post_rdma(post) {
            let tx = inner.rdmaq.pop_back();
            drop(inner);
            error!("{:#x}: RDMA post failed: {}", conn.peer_nid, e);
            if let Some(tx) = tx {
                self.tx_done(tx, Err(e.clone().into()));
            }
            self.close_conn(conn, e.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnParams;
    use crate::fabric::loopback::LoopbackNet;
    use crate::fabric::{Endpoint, FabricError, FmaSend};
    use crate::peer::Peer;
    use crate::tests::{test_shared, RecordingUpper};
    use crate::tx::Completion;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Endpoint fed from a test-controlled inbound queue
    #[derive(Default)]
    struct ScriptedEndpoint {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Endpoint for ScriptedEndpoint {
        fn cqid(&self) -> u32 {
            11
        }

        fn device(&self) -> u32 {
            0
        }

        fn fma_send(&self, msg: &[u8], _fence: bool) -> Result<FmaSend, FabricError> {
            self.sent.lock().push(msg.to_vec());
            Ok(FmaSend::Sent)
        }

        fn fma_recv(&self) -> Option<Vec<u8>> {
            self.inbound.lock().pop_front()
        }

        fn post_rdma(&self, _post: RdmaPost) -> Result<(), FabricError> {
            Ok(())
        }

        fn rdma_done(&self) -> Option<u64> {
            None
        }

        fn close(&self) {}
    }

    const PEER: u64 = 2;
    const INCARNATION: u64 = 77;

    fn setup(nal: &NalShared, ep: Arc<dyn Endpoint>) -> Arc<Conn> {
        let conn = Conn::new(
            ConnParams {
                peer_nid: PEER,
                local_nid: nal.nid(),
                incarnation: INCARNATION,
                peer_stamp: 1,
                dev_idx: 0,
                keepalive: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
                tx_seq: 0,
                rx_seq: 40,
            },
            ep,
        );
        let mut table = nal.table.write();
        table
            .peers
            .insert(PEER, Peer::new(PEER, None, 1, Duration::from_secs(1)));
        table.install(&conn).unwrap();
        conn
    }

    fn inject(ep: &ScriptedEndpoint, seq: u32, body: MsgBody) {
        let mut msg = Message::new(PEER, body);
        msg.incarnation = INCARNATION;
        msg.seq = seq;
        ep.inbound.lock().push_back(msg.encode());
    }

    fn sent_bodies(ep: &ScriptedEndpoint) -> Vec<MsgBody> {
        ep.sent
            .lock()
            .iter()
            .map(|b| Message::decode(b).unwrap().body)
            .collect()
    }

    #[test]
    fn test_immediate_delivered_upward() {
        let net = LoopbackNet::new();
        let upper = Arc::new(RecordingUpper::default());
        let nal = test_shared(&net, 1, upper.clone());
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        inject(
            &ep,
            40,
            MsgBody::Immediate {
                hdr: b"h".to_vec(),
                payload: vec![3; 64],
            },
        );
        assert!(nal.process_receives(&conn));
        assert!(!nal.process_receives(&conn));

        let got = upper.immediates.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (PEER, b"h".to_vec(), vec![3; 64]));
    }

    #[test]
    fn test_unmatched_put_is_nakked() {
        let net = LoopbackNet::new();
        let nal = test_shared(&net, 1, Arc::new(RecordingUpper::default()));
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        inject(&ep, 40, MsgBody::PutReq { hdr: vec![], cookie: 0x55 });
        nal.process_receives(&conn);
        nal.process_fmaq(&conn);

        assert_eq!(sent_bodies(&ep), vec![MsgBody::PutNak { cookie: 0x55 }]);
        assert_eq!(nal.pool.idle_count().1, nal.config.ntx_nblk);
    }

    #[test]
    fn test_nak_fails_request_with_no_match() {
        let net = LoopbackNet::new();
        let nal = test_shared(&net, 1, Arc::new(RecordingUpper::default()));
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        let (completion, rx) = Completion::channel();
        let mut tx = nal.pool.acquire(true).unwrap();
        tx.msg = Some(MsgBody::PutReq { hdr: vec![], cookie: 0 });
        tx.completions[0] = Some(completion);
        let cookie = tx.cookie;
        nal.post_fma(&conn, tx);
        nal.process_fmaq(&conn);
        assert_eq!(conn.info().replyq, 1);

        inject(&ep, 40, MsgBody::PutNak { cookie });
        nal.process_receives(&conn);

        let status = rx.try_recv().unwrap();
        assert_eq!(status, Err(NalError::NoMatch));
        assert_eq!(status.unwrap_err().errno(), libc::ENOENT);
        assert_eq!(conn.info().replyq, 0);
    }

    #[test]
    fn test_wrong_type_reply_leaves_entry() {
        let net = LoopbackNet::new();
        let nal = test_shared(&net, 1, Arc::new(RecordingUpper::default()));
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        let (completion, rx) = Completion::channel();
        let mut tx = nal.pool.acquire(true).unwrap();
        tx.msg = Some(MsgBody::GetReq {
            hdr: vec![],
            cookie: 0,
            desc: RdmaDesc::default(),
        });
        tx.completions[0] = Some(completion);
        let cookie = tx.cookie;
        nal.post_fma(&conn, tx);
        nal.process_fmaq(&conn);

        // PUT_NAK names the GET's cookie
        inject(&ep, 40, MsgBody::PutNak { cookie });
        nal.process_receives(&conn);
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.info().replyq, 1);
        assert_eq!(conn.state(), ConnState::Active);

        inject(&ep, 41, MsgBody::GetDone { cookie });
        nal.process_receives(&conn);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        let net = LoopbackNet::new();
        let nal = test_shared(&net, 1, Arc::new(RecordingUpper::default()));
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        inject(&ep, 41, MsgBody::Noop);
        nal.process_receives(&conn);
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(nal.table.read().find_conn(PEER).is_none());
    }

    #[test]
    fn test_garbage_tolerated_until_limit() {
        let net = LoopbackNet::new();
        let nal = test_shared(&net, 1, Arc::new(RecordingUpper::default()));
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        ep.inbound.lock().push_back(vec![0xde, 0xad, 0xbe, 0xef]);
        ep.inbound.lock().push_back(vec![0; 3]);
        nal.process_receives(&conn);
        nal.process_receives(&conn);
        assert_eq!(conn.state(), ConnState::Active);

        // A good message resets the count
        inject(&ep, 42, MsgBody::Noop);
        nal.process_receives(&conn);
        assert_eq!(conn.lock().protocol_errors, 0);

        for _ in 0..nal.config.max_protocol_errors {
            ep.inbound.lock().push_back(vec![1, 2, 3, 4]);
            nal.process_receives(&conn);
        }
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_close_handshake_terminates() {
        let net = LoopbackNet::new();
        let nal = test_shared(&net, 1, Arc::new(RecordingUpper::default()));
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        inject(&ep, 40, MsgBody::Close);
        nal.process_receives(&conn);
        assert_eq!(conn.state(), ConnState::Closing);

        nal.process_fmaq(&conn);
        assert_eq!(sent_bodies(&ep), vec![MsgBody::Close]);
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(nal.table.read().conn_by_cqid(11).is_none());
    }

    #[test]
    fn test_get_source_larger_than_sink_nakked() {
        let net = LoopbackNet::new();
        let upper = Arc::new(RecordingUpper::default());
        let nal = test_shared(&net, 1, upper.clone());
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());

        let (rx, _seg) = upper.offer_get_source(128);
        let desc = RdmaDesc {
            nob: 64,
            ..Default::default()
        };
        inject(&ep, 40, MsgBody::GetReq { hdr: vec![], cookie: 9, desc });
        nal.process_receives(&conn);
        nal.process_fmaq(&conn);

        assert_eq!(sent_bodies(&ep), vec![MsgBody::GetNak { cookie: 9 }]);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(NalError::MessageTooLarge { size: 128, max: 64 })
        ));
    }

    #[test]
    fn test_messages_dropped_while_closing() {
        let net = LoopbackNet::new();
        let upper = Arc::new(RecordingUpper::default());
        let nal = test_shared(&net, 1, upper.clone());
        let ep = Arc::new(ScriptedEndpoint::default());
        let conn = setup(&nal, ep.clone());
        nal.close_conn(&conn, NalError::Timeout);

        inject(
            &ep,
            40,
            MsgBody::Immediate {
                hdr: vec![],
                payload: vec![1; 8],
            },
        );
        assert!(nal.process_receives(&conn));
        assert!(upper.immediates.lock().is_empty());
        assert_eq!(conn.lock().rx_seq, 41);
    }
}
