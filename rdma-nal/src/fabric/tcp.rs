//! TCP fabric
//!
//! Runs the NAL over ordinary sockets. One TCP stream per endpoint
//! carries length-prefixed bincode frames; FMA credits travel back as
//! explicit frames and RDMA becomes a write frame answered by an ack.
//! Frames on one stream are applied in order, so a fenced message can
//! never overtake the RDMA posted before it.
//!
//! A single device (0) with one pair of completion queues.

use super::{
    CqEvent, DeviceCallback, DeviceId, DeviceQueues, Endpoint, Fabric, FabricError, FmaSend,
    Hello, Incoming, MemRegion, MemoryRegistry, RdmaPost,
};
use crate::wire::MemKey;
use crate::Nid;
use anyhow::{anyhow, bail, Context, Result};
use bincode::{deserialize, serialize};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DEFAULT_PORT: u16 = 50051;
const MAX_FRAME: usize = 64 * 1024 * 1024;
const DEVICE: DeviceId = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpFabricConfig {
    pub nid: Nid,
    /// Address the listener binds
    pub listen: String,
    /// Known node addresses, used when a peer has none of its own
    pub peers: HashMap<Nid, String>,
    /// Messages the remote may have outstanding on one endpoint
    pub fma_credits: usize,
    pub max_registrations: usize,
    pub cq_capacity: usize,
}

impl Default for TcpFabricConfig {
    fn default() -> Self {
        Self {
            nid: 0,
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            peers: HashMap::new(),
            fma_credits: 64,
            max_registrations: 4096,
            cq_capacity: 4096,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello(Hello),
    /// `None` rejects the handshake
    HelloReply(Option<Hello>),
    Fma { msg: Vec<u8> },
    /// The receiver consumed one message
    Credit,
    RdmaWrite {
        app_id: u64,
        key: MemKey,
        addr: u64,
        data: Vec<u8>,
    },
    RdmaAck { app_id: u64, ok: bool },
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    let data = serialize(frame)?;
    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// Next frame, or `None` at a clean end of stream
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        bail!("Frame too large: {}", len);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(deserialize(&buf)?))
}

/// State shared by the fabric and its endpoints' socket tasks
struct Shared {
    registry: MemoryRegistry,
    device: DeviceQueues,
    next_cqid: AtomicU32,
    credits: usize,
    endpoints: Mutex<Vec<Weak<TcpEndpoint>>>,
}

pub struct TcpFabric {
    nid: Nid,
    runtime: Runtime,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<Nid, String>>,
    shared: Arc<Shared>,
    incoming_rx: Receiver<Incoming>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TcpFabric {
    pub fn new(config: TcpFabricConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("ranal_tcp")
            .enable_all()
            .build()
            .context("Failed to create Tokio runtime")?;

        let listener = runtime
            .block_on(TcpListener::bind(&config.listen))
            .with_context(|| format!("Failed to bind TCP listener on {}", config.listen))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| anyhow!("Failed to get local address: {}", e))?;

        let shared = Arc::new(Shared {
            registry: MemoryRegistry::new(config.max_registrations),
            device: DeviceQueues::new(DEVICE, config.cq_capacity),
            next_cqid: AtomicU32::new(1),
            credits: config.fma_credits,
            endpoints: Mutex::new(Vec::new()),
        });

        let (incoming_tx, incoming_rx) = unbounded();
        let listener = runtime.spawn(listener_task(listener, shared.clone(), incoming_tx));

        info!("TCP fabric for node {:#x} listening on {}", config.nid, local_addr);

        Ok(Self {
            nid: config.nid,
            runtime,
            local_addr,
            peers: RwLock::new(config.peers),
            shared,
            incoming_rx,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Address other nodes should use to reach this one
    pub fn local_addr(&self) -> String {
        let ip = if self.local_addr.ip().is_unspecified() {
            local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            self.local_addr.ip()
        };
        SocketAddr::new(ip, self.local_addr.port()).to_string()
    }

    pub fn add_peer_addr(&self, nid: Nid, addr: String) {
        self.peers.write().insert(nid, addr);
    }

    fn check_device(dev: DeviceId) -> Result<(), FabricError> {
        if dev == DEVICE {
            Ok(())
        } else {
            Err(FabricError::UnknownDevice(dev))
        }
    }
}

async fn listener_task(listener: TcpListener, shared: Arc<Shared>, incoming: Sender<Incoming>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!("Accepted connection from {}", peer_addr);
                let (shared, incoming) = (shared.clone(), incoming.clone());
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(socket, shared, incoming).await {
                        warn!("Handshake from {} failed: {:#}", peer_addr, e);
                    }
                });
            }
            Err(e) => warn!("Accept error: {}", e),
        }
    }
}

async fn accept_connection(
    mut socket: TcpStream,
    shared: Arc<Shared>,
    incoming: Sender<Incoming>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let hello = match read_frame(&mut socket).await? {
        Some(Frame::Hello(hello)) => hello,
        other => bail!("Expected hello, got {:?}", other),
    };

    let ep = TcpEndpoint::start(socket, shared);
    let reply_ep = ep.clone();
    let req = Incoming::new(ep, hello, move |reply| {
        reply_ep.queue(Frame::HelloReply(reply));
    });
    incoming
        .send(req)
        .map_err(|_| anyhow!("Nobody is accepting connections"))
}

async fn connect_stream(addr: &str, hello: Hello) -> Result<(TcpStream, Hello)> {
    let mut socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    socket.set_nodelay(true)?;
    write_frame(&mut socket, &Frame::Hello(hello)).await?;
    match read_frame(&mut socket).await? {
        Some(Frame::HelloReply(Some(reply))) => Ok((socket, reply)),
        Some(Frame::HelloReply(None)) => bail!("{} rejected handshake", addr),
        other => bail!("Expected hello reply from {}, got {:?}", addr, other),
    }
}

impl Fabric for TcpFabric {
    fn devices(&self) -> Vec<DeviceId> {
        vec![DEVICE]
    }

    fn set_device_callback(&self, dev: DeviceId, cb: DeviceCallback) -> Result<(), FabricError> {
        Self::check_device(dev)?;
        self.shared.device.set_callback(cb);
        Ok(())
    }

    fn register(&self, dev: DeviceId, region: MemRegion) -> Result<MemKey, FabricError> {
        Self::check_device(dev)?;
        self.shared.registry.register(dev, region)
    }

    fn deregister(&self, _dev: DeviceId, key: MemKey) -> Result<(), FabricError> {
        self.shared.registry.deregister(key)
    }

    fn resolve(&self, nid: Nid) -> Result<String, FabricError> {
        self.peers
            .read()
            .get(&nid)
            .cloned()
            .ok_or(FabricError::Unresolved(nid))
    }

    fn connect(
        &self,
        dev: DeviceId,
        addr: &str,
        hello: Hello,
        timeout: Duration,
    ) -> Result<(Arc<dyn Endpoint>, Hello), FabricError> {
        Self::check_device(dev)?;
        let (socket, reply) = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, connect_stream(addr, hello)).await })
            .map_err(|_| FabricError::ConnectFailed(format!("{} timed out", addr)))?
            .map_err(|e| FabricError::ConnectFailed(format!("{:#}", e)))?;

        let _guard = self.runtime.enter();
        let ep = TcpEndpoint::start(socket, self.shared.clone());
        debug!("Node {:#x} connected to {}, cqid {}", self.nid, addr, ep.cqid);
        Ok((ep as Arc<dyn Endpoint>, reply))
    }

    fn incoming(&self) -> Receiver<Incoming> {
        self.incoming_rx.clone()
    }

    fn poll_rdma_cq(&self, dev: DeviceId) -> Option<CqEvent> {
        Self::check_device(dev).ok()?;
        self.shared.device.poll_rdma()
    }

    fn poll_fma_cq(&self, dev: DeviceId) -> Option<CqEvent> {
        Self::check_device(dev).ok()?;
        self.shared.device.poll_fma()
    }

    fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let endpoints = std::mem::take(&mut *self.shared.endpoints.lock());
        for ep in endpoints.iter().filter_map(Weak::upgrade) {
            ep.close();
        }
        info!("TCP fabric for node {:#x} shut down", self.nid);
    }
}

impl Drop for TcpFabric {
    fn drop(&mut self) {
        debug!("Dropping TCP fabric for node {:#x}", self.nid);
        self.shutdown();
    }
}

pub struct TcpEndpoint {
    cqid: u32,
    shared: Arc<Shared>,
    /// Taken on close, which ends the writer task
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Messages we may still send before the remote returns credits
    credits: AtomicUsize,
    blocked: AtomicBool,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    rdma_done: Mutex<VecDeque<u64>>,
    closed: AtomicBool,
}

impl TcpEndpoint {
    /// Wrap a handshaken stream; must run inside the fabric's runtime
    fn start(socket: TcpStream, shared: Arc<Shared>) -> Arc<Self> {
        let (read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let ep = Arc::new(Self {
            cqid: shared.next_cqid.fetch_add(1, Ordering::Relaxed),
            credits: AtomicUsize::new(shared.credits),
            shared: shared.clone(),
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(None),
            blocked: AtomicBool::new(false),
            inbound: Mutex::new(VecDeque::new()),
            rdma_done: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(writer_task(write_half, rx, ep.cqid));
        let reader = tokio::spawn(reader_task(read_half, Arc::downgrade(&ep)));
        *ep.reader.lock() = Some(reader);

        let mut endpoints = shared.endpoints.lock();
        endpoints.retain(|e| e.strong_count() > 0);
        endpoints.push(Arc::downgrade(&ep));
        ep
    }

    fn queue(&self, frame: Frame) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn take_credit(&self) -> bool {
        loop {
            let c = self.credits.load(Ordering::SeqCst);
            if c == 0 {
                self.blocked.store(true, Ordering::SeqCst);
                // A credit may have arrived before the flag was visible
                if self.credits.load(Ordering::SeqCst) == 0 {
                    return false;
                }
                continue;
            }
            if self
                .credits
                .compare_exchange(c, c - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn handle(&self, frame: Frame) {
        match frame {
            Frame::Fma { msg } => {
                self.inbound.lock().push_back(msg);
                self.shared.device.raise_fma(self.cqid);
            }
            Frame::Credit => {
                self.credits.fetch_add(1, Ordering::SeqCst);
                if self.blocked.swap(false, Ordering::SeqCst) {
                    self.shared.device.raise_fma(self.cqid);
                }
            }
            Frame::RdmaWrite {
                app_id,
                key,
                addr,
                data,
            } => {
                let ok = match self.shared.registry.write(&key, addr, &data) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("cqid {}: RDMA write {:#x} rejected: {}", self.cqid, app_id, e);
                        false
                    }
                };
                self.queue(Frame::RdmaAck { app_id, ok });
            }
            Frame::RdmaAck { app_id, ok } => {
                if !ok {
                    warn!("cqid {}: remote rejected RDMA {:#x}", self.cqid, app_id);
                }
                self.rdma_done.lock().push_back(app_id);
                self.shared.device.raise_rdma(self.cqid);
            }
            other => warn!("cqid {}: unexpected frame {:?}", self.cqid, other),
        }
    }
}

async fn writer_task(mut w: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>, cqid: u32) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut w, &frame).await {
            debug!("cqid {}: write failed: {}", cqid, e);
            break;
        }
    }
    let _ = w.shutdown().await;
}

async fn reader_task(mut r: OwnedReadHalf, ep: Weak<TcpEndpoint>) {
    loop {
        let frame = read_frame(&mut r).await;
        let Some(ep) = ep.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(frame)) => ep.handle(frame),
            Ok(None) => {
                debug!("cqid {}: stream closed by peer", ep.cqid);
                break;
            }
            Err(e) => {
                warn!("cqid {}: read failed: {:#}", ep.cqid, e);
                break;
            }
        }
    }
    if let Some(ep) = ep.upgrade() {
        ep.closed.store(true, Ordering::Release);
        ep.outbound.lock().take();
        // Let the scheduler find out through a failing send
        ep.shared.device.raise_fma(ep.cqid);
    }
}

impl Endpoint for TcpEndpoint {
    fn cqid(&self) -> u32 {
        self.cqid
    }

    fn device(&self) -> DeviceId {
        DEVICE
    }

    fn fma_send(&self, msg: &[u8], _fence: bool) -> Result<FmaSend, FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        if !self.take_credit() {
            return Ok(FmaSend::NoCredits);
        }
        if self.queue(Frame::Fma { msg: msg.to_vec() }) {
            Ok(FmaSend::Sent)
        } else {
            Err(FabricError::Closed)
        }
    }

    fn fma_recv(&self) -> Option<Vec<u8>> {
        let msg = self.inbound.lock().pop_front()?;
        self.queue(Frame::Credit);
        Some(msg)
    }

    fn post_rdma(&self, post: RdmaPost) -> Result<(), FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        let data = self
            .shared
            .registry
            .read(&post.src_key, post.src_addr, post.nob)?;
        let frame = Frame::RdmaWrite {
            app_id: post.app_id,
            key: post.dst.key,
            addr: post.dst.addr,
            data,
        };
        if self.queue(frame) {
            Ok(())
        } else {
            Err(FabricError::Closed)
        }
    }

    fn rdma_done(&self) -> Option<u64> {
        self.rdma_done.lock().pop_front()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        debug!("TCP endpoint cqid {} closed", self.cqid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Segment;
    use crate::wire::{RdmaDesc, MSG_VERSION};
    use std::thread;
    use std::time::Instant;

    fn fabric(nid: Nid) -> TcpFabric {
        TcpFabric::new(TcpFabricConfig {
            nid,
            listen: "127.0.0.1:0".to_string(),
            fma_credits: 2,
            ..Default::default()
        })
        .unwrap()
    }

    fn hello(src: Nid, dst: Nid) -> Hello {
        Hello {
            version: MSG_VERSION,
            src_nid: src,
            dst_nid: dst,
            incarnation: 3,
            initial_seq: 0,
            timeout_secs: 30,
            stamp: 1,
        }
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(Instant::now() < deadline, "timed out waiting");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn connect(a: &TcpFabric, b: &TcpFabric) -> (Arc<dyn Endpoint>, Arc<dyn Endpoint>) {
        let incoming = b.incoming();
        let acceptor = thread::spawn(move || {
            let req = incoming.recv().unwrap();
            assert_eq!(req.hello.src_nid, 1);
            req.accept(hello(2, 1))
        });
        let (ep, reply) = a
            .connect(0, &b.local_addr(), hello(1, 2), Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply.src_nid, 2);
        (ep, acceptor.join().unwrap())
    }

    #[test]
    fn test_frame_roundtrip() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, &Frame::RdmaAck { app_id: 7, ok: true }).await.unwrap();
            let mut r = &buf[..];
            assert!(matches!(
                read_frame(&mut r).await.unwrap(),
                Some(Frame::RdmaAck { app_id: 7, ok: true })
            ));
            assert!(read_frame(&mut r).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let buf = ((MAX_FRAME + 1) as u32).to_be_bytes();
        let mut r = &buf[..];
        assert!(rt.block_on(read_frame(&mut r)).is_err());
    }

    #[test]
    fn test_messages_and_credits() {
        let (a, b) = (fabric(1), fabric(2));
        let (ep, passive) = connect(&a, &b);

        assert_eq!(ep.fma_send(b"one", false), Ok(FmaSend::Sent));
        assert_eq!(ep.fma_send(b"two", false), Ok(FmaSend::Sent));
        assert_eq!(ep.fma_send(b"three", false), Ok(FmaSend::NoCredits));

        assert_eq!(wait_for(|| passive.fma_recv()), b"one".to_vec());
        // The returned credit raises an event for the blocked sender
        let ev = wait_for(|| a.poll_fma_cq(0));
        assert_eq!(ev.cqid, ep.cqid());
        assert_eq!(ep.fma_send(b"three", false), Ok(FmaSend::Sent));
        assert_eq!(wait_for(|| passive.fma_recv()), b"two".to_vec());
        assert_eq!(wait_for(|| passive.fma_recv()), b"three".to_vec());
    }

    #[test]
    fn test_rdma_write_is_acked() {
        let (a, b) = (fabric(1), fabric(2));
        let (ep, _passive) = connect(&a, &b);

        let src = Segment::from_vec((0..100u8).collect());
        let dst = Segment::new(100);
        let src_key = a
            .register(0, MemRegion::Virt { seg: src.clone(), offset: 0, len: 100 })
            .unwrap();
        let dst_key = b
            .register(0, MemRegion::Virt { seg: dst.clone(), offset: 0, len: 100 })
            .unwrap();

        ep.post_rdma(RdmaPost {
            app_id: 9,
            src_key,
            src_addr: src.addr(),
            dst: RdmaDesc {
                key: dst_key,
                addr: dst.addr(),
                nob: 100,
            },
            nob: 100,
        })
        .unwrap();

        assert_eq!(wait_for(|| ep.rdma_done()), 9);
        assert_eq!(dst.to_vec(), src.to_vec());
    }

    #[test]
    fn test_rejected_handshake() {
        let (a, b) = (fabric(1), fabric(2));
        let incoming = b.incoming();
        let rejector = thread::spawn(move || incoming.recv().unwrap().reject());

        let err = a
            .connect(0, &b.local_addr(), hello(1, 2), Duration::from_secs(5))
            .err();
        rejector.join().unwrap();
        assert!(matches!(err, Some(FabricError::ConnectFailed(_))));
    }

    #[test]
    fn test_unknown_peer_unresolved() {
        let a = fabric(1);
        assert_eq!(a.resolve(5), Err(FabricError::Unresolved(5)));
        a.add_peer_addr(5, "10.1.1.5:50051".to_string());
        assert_eq!(a.resolve(5).unwrap(), "10.1.1.5:50051");
    }
}
