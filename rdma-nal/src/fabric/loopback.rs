//! In-process fabric
//!
//! Every node of a [`LoopbackNet`] is a [`LoopbackFabric`] living in the
//! same process; node addresses are the node id in decimal. Sends are
//! queued on the peer endpoint under a credit limit and RDMA is a copy
//! between the two nodes' registries. Knobs let tests refuse handshakes
//! and hold RDMA completions back.

use super::{
    CqEvent, DeviceCallback, DeviceId, DeviceQueues, Endpoint, Fabric, FabricError, FmaSend,
    Hello, Incoming, MemRegion, MemoryRegistry, RdmaPost,
};
use crate::wire::MemKey;
use crate::Nid;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub devices: Vec<DeviceId>,
    /// Messages a sender may have outstanding on one endpoint
    pub fma_credits: usize,
    pub cq_capacity: usize,
    pub max_registrations: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            devices: vec![0],
            fma_credits: 64,
            cq_capacity: 1024,
            max_registrations: 4096,
        }
    }
}

/// Directory of the nodes sharing one in-process network
#[derive(Default)]
pub struct LoopbackNet {
    nodes: Mutex<HashMap<Nid, Weak<LoopbackFabric>>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(self: &Arc<Self>, nid: Nid, opts: LoopbackOptions) -> Arc<LoopbackFabric> {
        let (incoming_tx, incoming_rx) = unbounded();
        let fabric = Arc::new_cyclic(|me| LoopbackFabric {
            nid,
            me: me.clone(),
            net: Arc::downgrade(self),
            registry: MemoryRegistry::new(opts.max_registrations),
            devices: opts
                .devices
                .iter()
                .map(|&id| DeviceQueues::new(id, opts.cq_capacity))
                .collect(),
            next_cqid: AtomicU32::new(1),
            incoming_tx,
            incoming_rx,
            endpoints: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            hold_rdma: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            opts,
        });
        self.nodes.lock().insert(nid, Arc::downgrade(&fabric));
        debug!("Loopback node {:#x} added", nid);
        fabric
    }

    fn node(&self, nid: Nid) -> Option<Arc<LoopbackFabric>> {
        self.nodes.lock().get(&nid).and_then(Weak::upgrade)
    }
}

pub struct LoopbackFabric {
    nid: Nid,
    me: Weak<LoopbackFabric>,
    net: Weak<LoopbackNet>,
    opts: LoopbackOptions,
    registry: MemoryRegistry,
    devices: Vec<DeviceQueues>,
    next_cqid: AtomicU32,
    incoming_tx: Sender<Incoming>,
    incoming_rx: Receiver<Incoming>,
    endpoints: Mutex<Vec<Weak<LoopbackEndpoint>>>,
    refuse: AtomicBool,
    hold_rdma: AtomicBool,
    held: Mutex<Vec<(Arc<LoopbackEndpoint>, RdmaPost)>>,
}

impl LoopbackFabric {
    pub fn nid(&self) -> Nid {
        self.nid
    }

    /// Reject every handshake addressed to this node
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Queue RDMA posted from this node instead of completing it
    pub fn hold_rdma(&self, hold: bool) {
        self.hold_rdma.store(hold, Ordering::SeqCst);
    }

    /// Complete every held RDMA; returns how many there were
    pub fn release_held_rdma(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        for (ep, post) in &held {
            if let Err(e) = ep.transfer(post) {
                warn!("Held RDMA {:#x} failed: {}", post.app_id, e);
            }
            ep.rdma_complete(post.app_id);
        }
        held.len()
    }

    pub fn registrations(&self) -> usize {
        self.registry.len()
    }

    /// Inject an FMA completion as if the hardware had raised it
    pub fn raise_fma_event(&self, dev: DeviceId, cqid: u32) {
        if let Some(d) = self.device(dev) {
            d.raise_fma(cqid);
        }
    }

    fn device(&self, dev: DeviceId) -> Option<&DeviceQueues> {
        self.devices.iter().find(|d| d.id == dev)
    }

    fn new_endpoint(&self, dev: DeviceId) -> Arc<LoopbackEndpoint> {
        let ep = Arc::new_cyclic(|me| LoopbackEndpoint {
            cqid: self.next_cqid.fetch_add(1, Ordering::Relaxed),
            dev,
            me: me.clone(),
            fabric: self.me.clone(),
            credits: self.opts.fma_credits,
            peer: OnceLock::new(),
            inbound: Mutex::new(VecDeque::new()),
            blocked: AtomicBool::new(false),
            rdma_done: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|e| e.strong_count() > 0);
        endpoints.push(Arc::downgrade(&ep));
        ep
    }
}

impl Fabric for LoopbackFabric {
    fn devices(&self) -> Vec<DeviceId> {
        self.opts.devices.clone()
    }

    fn set_device_callback(&self, dev: DeviceId, cb: DeviceCallback) -> Result<(), FabricError> {
        let d = self.device(dev).ok_or(FabricError::UnknownDevice(dev))?;
        d.set_callback(cb);
        Ok(())
    }

    fn register(&self, dev: DeviceId, region: MemRegion) -> Result<MemKey, FabricError> {
        self.device(dev).ok_or(FabricError::UnknownDevice(dev))?;
        self.registry.register(dev, region)
    }

    fn deregister(&self, _dev: DeviceId, key: MemKey) -> Result<(), FabricError> {
        self.registry.deregister(key)
    }

    fn resolve(&self, nid: Nid) -> Result<String, FabricError> {
        let net = self.net.upgrade().ok_or(FabricError::Closed)?;
        match net.node(nid) {
            Some(_) => Ok(nid.to_string()),
            None => Err(FabricError::Unresolved(nid)),
        }
    }

    fn connect(
        &self,
        dev: DeviceId,
        addr: &str,
        hello: Hello,
        timeout: Duration,
    ) -> Result<(Arc<dyn Endpoint>, Hello), FabricError> {
        self.device(dev).ok_or(FabricError::UnknownDevice(dev))?;
        let nid: Nid = addr
            .parse()
            .map_err(|_| FabricError::ConnectFailed(format!("bad loopback address {:?}", addr)))?;
        let net = self.net.upgrade().ok_or(FabricError::Closed)?;
        let remote = net
            .node(nid)
            .ok_or_else(|| FabricError::ConnectFailed(format!("no node at {}", addr)))?;
        if remote.refuse.load(Ordering::SeqCst) {
            return Err(FabricError::ConnectFailed(format!("{} refused connection", addr)));
        }

        // Same device id on the remote if it has one
        let remote_dev = remote
            .device(dev)
            .map(|d| d.id)
            .or_else(|| remote.opts.devices.first().copied())
            .ok_or(FabricError::UnknownDevice(dev))?;

        let local = self.new_endpoint(dev);
        let passive = remote.new_endpoint(remote_dev);
        let _ = local.peer.set(Arc::downgrade(&passive));
        let _ = passive.peer.set(Arc::downgrade(&local));

        let (reply_tx, reply_rx) = bounded(1);
        let incoming = Incoming::new(passive, hello, move |reply| {
            let _ = reply_tx.send(reply);
        });
        remote
            .incoming_tx
            .send(incoming)
            .map_err(|_| FabricError::ConnectFailed(format!("{} not accepting", addr)))?;

        match reply_rx.recv_timeout(timeout) {
            Ok(Some(reply)) => {
                debug!("Loopback {:#x} connected to {:#x}, cqid {}", self.nid, nid, local.cqid);
                Ok((local as Arc<dyn Endpoint>, reply))
            }
            Ok(None) | Err(RecvTimeoutError::Disconnected) => {
                local.close();
                Err(FabricError::ConnectFailed(format!("{} rejected handshake", addr)))
            }
            Err(RecvTimeoutError::Timeout) => {
                local.close();
                Err(FabricError::ConnectFailed(format!("{} timed out", addr)))
            }
        }
    }

    fn incoming(&self) -> Receiver<Incoming> {
        self.incoming_rx.clone()
    }

    fn poll_rdma_cq(&self, dev: DeviceId) -> Option<CqEvent> {
        self.device(dev)?.poll_rdma()
    }

    fn poll_fma_cq(&self, dev: DeviceId) -> Option<CqEvent> {
        self.device(dev)?.poll_fma()
    }

    fn shutdown(&self) {
        let endpoints = std::mem::take(&mut *self.endpoints.lock());
        for ep in endpoints.iter().filter_map(Weak::upgrade) {
            ep.close();
        }
        self.held.lock().clear();
        info!("Loopback node {:#x} shut down", self.nid);
    }
}

pub struct LoopbackEndpoint {
    cqid: u32,
    dev: DeviceId,
    me: Weak<LoopbackEndpoint>,
    fabric: Weak<LoopbackFabric>,
    credits: usize,
    peer: OnceLock<Weak<LoopbackEndpoint>>,
    /// Messages sent to us by the peer
    inbound: Mutex<VecDeque<Vec<u8>>>,
    /// Set when a send found the peer's inbound queue full; checked by
    /// the peer under its inbound lock
    blocked: AtomicBool,
    rdma_done: Mutex<VecDeque<u64>>,
    closed: AtomicBool,
}

impl LoopbackEndpoint {
    fn peer(&self) -> Option<Arc<LoopbackEndpoint>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn raise_fma(&self) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.raise_fma_event(self.dev, self.cqid);
        }
    }

    fn transfer(&self, post: &RdmaPost) -> Result<(), FabricError> {
        let fabric = self.fabric.upgrade().ok_or(FabricError::Closed)?;
        let remote = self
            .peer()
            .and_then(|p| p.fabric.upgrade())
            .ok_or(FabricError::Closed)?;
        let data = fabric.registry.read(&post.src_key, post.src_addr, post.nob)?;
        remote.registry.write(&post.dst.key, post.dst.addr, &data)
    }

    fn rdma_complete(&self, app_id: u64) {
        self.rdma_done.lock().push_back(app_id);
        if let Some(fabric) = self.fabric.upgrade() {
            if let Some(d) = fabric.device(self.dev) {
                d.raise_rdma(self.cqid);
            }
        }
    }
}

impl Endpoint for LoopbackEndpoint {
    fn cqid(&self) -> u32 {
        self.cqid
    }

    fn device(&self) -> DeviceId {
        self.dev
    }

    fn fma_send(&self, msg: &[u8], _fence: bool) -> Result<FmaSend, FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        let peer = self.peer().ok_or(FabricError::Closed)?;
        if peer.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }

        {
            let mut inbound = peer.inbound.lock();
            if inbound.len() >= self.credits {
                self.blocked.store(true, Ordering::Release);
                return Ok(FmaSend::NoCredits);
            }
            inbound.push_back(msg.to_vec());
        }
        peer.raise_fma();
        Ok(FmaSend::Sent)
    }

    fn fma_recv(&self) -> Option<Vec<u8>> {
        let peer = self.peer();
        let (msg, unblock) = {
            let mut inbound = self.inbound.lock();
            let msg = inbound.pop_front()?;
            let unblock = peer
                .as_ref()
                .is_some_and(|p| p.blocked.swap(false, Ordering::AcqRel));
            (msg, unblock)
        };
        if unblock {
            if let Some(p) = peer {
                p.raise_fma();
            }
        }
        Some(msg)
    }

    fn post_rdma(&self, post: RdmaPost) -> Result<(), FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        let fabric = self.fabric.upgrade().ok_or(FabricError::Closed)?;
        if fabric.hold_rdma.load(Ordering::SeqCst) {
            let me = self.me.upgrade().ok_or(FabricError::Closed)?;
            fabric.held.lock().push((me, post));
            return Ok(());
        }
        self.transfer(&post)?;
        self.rdma_complete(post.app_id);
        Ok(())
    }

    fn rdma_done(&self) -> Option<u64> {
        self.rdma_done.lock().pop_front()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inbound.lock().clear();
        debug!("Loopback endpoint cqid {} closed", self.cqid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Segment;
    use crate::wire::RdmaDesc;
    use std::thread;

    fn hello(src: Nid, dst: Nid) -> Hello {
        Hello {
            version: crate::wire::MSG_VERSION,
            src_nid: src,
            dst_nid: dst,
            incarnation: 1,
            initial_seq: 0,
            timeout_secs: 30,
            stamp: 1,
        }
    }

    /// Connect 1 to 2, answering the handshake on another thread
    fn pair(
        opts: LoopbackOptions,
    ) -> (Arc<LoopbackFabric>, Arc<LoopbackFabric>, Arc<dyn Endpoint>, Arc<dyn Endpoint>) {
        let net = LoopbackNet::new();
        let a = net.add_node(1, opts.clone());
        let b = net.add_node(2, opts);

        let incoming = b.incoming();
        let acceptor = thread::spawn(move || {
            let inc = incoming.recv().unwrap();
            inc.accept(hello(2, 1))
        });
        let (ep, reply) = a.connect(0, "2", hello(1, 2), Duration::from_secs(5)).unwrap();
        assert_eq!(reply.src_nid, 2);
        let passive = acceptor.join().unwrap();
        (a, b, ep, passive)
    }

    #[test]
    fn test_send_raises_event_on_receiver() {
        let (_a, b, ep, passive) = pair(LoopbackOptions::default());

        assert_eq!(ep.fma_send(b"ping", false), Ok(FmaSend::Sent));
        assert_eq!(
            b.poll_fma_cq(0),
            Some(CqEvent {
                cqid: passive.cqid(),
                overrun: false
            })
        );
        assert_eq!(passive.fma_recv(), Some(b"ping".to_vec()));
        assert_eq!(passive.fma_recv(), None);
    }

    #[test]
    fn test_credits_return_with_event() {
        let opts = LoopbackOptions {
            fma_credits: 1,
            ..Default::default()
        };
        let (a, _b, ep, passive) = pair(opts);

        assert_eq!(ep.fma_send(b"1", false), Ok(FmaSend::Sent));
        assert_eq!(ep.fma_send(b"2", false), Ok(FmaSend::NoCredits));
        while a.poll_fma_cq(0).is_some() {}

        passive.fma_recv().unwrap();
        assert_eq!(
            a.poll_fma_cq(0),
            Some(CqEvent {
                cqid: ep.cqid(),
                overrun: false
            })
        );
        assert_eq!(ep.fma_send(b"2", false), Ok(FmaSend::Sent));
    }

    #[test]
    fn test_rdma_copies_between_nodes() {
        let (a, b, ep, _passive) = pair(LoopbackOptions::default());

        let src = Segment::from_vec(vec![9u8; 64]);
        let dst = Segment::new(64);
        let src_key = a
            .register(0, MemRegion::Virt { seg: src.clone(), offset: 0, len: 64 })
            .unwrap();
        let dst_key = b
            .register(0, MemRegion::Virt { seg: dst.clone(), offset: 0, len: 64 })
            .unwrap();

        a.hold_rdma(true);
        ep.post_rdma(RdmaPost {
            app_id: 42,
            src_key,
            src_addr: src.addr(),
            dst: RdmaDesc {
                key: dst_key,
                addr: dst.addr() + 16,
                nob: 32,
            },
            nob: 32,
        })
        .unwrap();
        assert_eq!(ep.rdma_done(), None);
        assert_eq!(dst.read(16, 32).unwrap(), vec![0u8; 32]);

        assert_eq!(a.release_held_rdma(), 1);
        assert_eq!(ep.rdma_done(), Some(42));
        assert_eq!(a.poll_rdma_cq(0).map(|e| e.cqid), Some(ep.cqid()));
        assert_eq!(dst.read(16, 32).unwrap(), vec![9u8; 32]);
        assert_eq!(dst.read(0, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_refused_and_unknown_nodes() {
        let net = LoopbackNet::new();
        let a = net.add_node(1, LoopbackOptions::default());
        let b = net.add_node(2, LoopbackOptions::default());
        b.refuse_connections(true);

        let t = Duration::from_millis(100);
        assert!(matches!(
            a.connect(0, "2", hello(1, 2), t),
            Err(FabricError::ConnectFailed(_))
        ));
        assert!(matches!(
            a.connect(0, "3", hello(1, 3), t),
            Err(FabricError::ConnectFailed(_))
        ));
        assert_eq!(a.resolve(2), Ok("2".to_string()));
        assert_eq!(a.resolve(3), Err(FabricError::Unresolved(3)));
    }

    #[test]
    fn test_send_to_closed_peer_fails() {
        let (_a, _b, ep, passive) = pair(LoopbackOptions::default());
        passive.close();
        assert_eq!(ep.fma_send(b"x", false), Err(FabricError::Closed));
    }
}
