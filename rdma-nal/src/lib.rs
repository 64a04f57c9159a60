//! RDMA network abstraction layer
//!
//! Moves RPC messages between cluster nodes over a fabric that offers
//! short credit-backed sends plus bulk RDMA. Small payloads travel inline
//! (IMMEDIATE); larger ones negotiate a registered sink with the peer and
//! move by RDMA (PUT and GET).
//!
//! Threads, not tasks: one scheduler per fabric device, one connect
//! daemon, one acceptor, one reaper, plus any number of caller threads
//! issuing sends.
//!
//! ```text
//! caller --send()--> peer queue --connd--> conn.fmaq --scheduler--> fabric
//!                                              ^                      |
//!                     rdmaq <--RDMA posted-----+---- dispatch <-------+
//! ```

pub mod buffer;
pub mod config;
pub mod conn;
mod connd;
mod dispatch;
pub mod error;
pub mod fabric;
pub mod peer;
mod reaper;
mod scheduler;
pub mod tx;
pub mod upper;
pub mod wire;

pub use buffer::{Iov, Kiov, Payload, Segment};
pub use config::NalConfig;
pub use conn::{ConnInfo, ConnState};
pub use error::{NalError, Result};
pub use peer::PeerInfo;
pub use tx::Completion;
pub use upper::{Matched, Upper};

use crate::buffer::{BufType, Buffer};
use crate::conn::Conn;
use crate::fabric::Fabric;
use crate::peer::{ConnTable, Peer};
use crate::scheduler::Device;
use crate::tx::{Tx, TxPool};
use crate::wire::{MsgBody, MAX_UPPER_HDR};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Node identifier
pub type Nid = u64;

pub const PAGE_SIZE: usize = 4096;

/// One outbound operation as requested by the RPC layer
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub nid: Nid,
    /// Opaque upper-layer header, at most 256 bytes
    pub hdr: Vec<u8>,
    pub payload: Payload,
    pub offset: usize,
    pub len: usize,
    /// False on paths that must not sleep waiting for a descriptor
    pub may_block: bool,
}

impl SendRequest {
    pub fn new(nid: Nid, hdr: Vec<u8>) -> Self {
        Self {
            nid,
            hdr,
            payload: Payload::None,
            offset: 0,
            len: 0,
            may_block: true,
        }
    }

    pub fn with_payload(mut self, payload: Payload, offset: usize, len: usize) -> Self {
        self.payload = payload;
        self.offset = offset;
        self.len = len;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.may_block = false;
        self
    }
}

/// State shared by the NAL's worker threads and callers
pub(crate) struct NalShared {
    pub config: NalConfig,
    pub fabric: Arc<dyn Fabric>,
    pub upper: Arc<dyn Upper>,
    pub pool: TxPool,
    pub table: ConnTable,
    pub devices: Vec<Arc<Device>>,
    /// Startup time in microseconds, announced in every handshake
    pub stamp: u64,
    /// Peers that need a connection
    pub connd_tx: Sender<Nid>,
    /// New connection timeouts for the reaper
    pub reaper_tx: Sender<Duration>,
    /// A connection is waiting for a memory registration to free up
    pub map_waiters: AtomicBool,
    shutdown: AtomicBool,
}

pub(crate) struct WorkerQueues {
    pub connd_rx: Receiver<Nid>,
    pub reaper_rx: Receiver<Duration>,
}

impl NalShared {
    pub fn new(
        config: NalConfig,
        fabric: Arc<dyn Fabric>,
        upper: Arc<dyn Upper>,
    ) -> Result<(Arc<Self>, WorkerQueues)> {
        config.validate()?;

        let available = fabric.devices();
        for dev in &config.devices {
            if !available.contains(dev) {
                return Err(fabric::FabricError::UnknownDevice(*dev).into());
            }
        }

        let devices = config
            .devices
            .iter()
            .enumerate()
            .map(|(idx, &id)| Arc::new(Device::new(id, idx)))
            .collect::<Vec<_>>();

        for dev in &devices {
            let weak = Arc::downgrade(dev);
            fabric.set_device_callback(
                dev.id,
                Arc::new(move |_| {
                    if let Some(dev) = weak.upgrade() {
                        dev.notify_ready();
                    }
                }),
            )?;
        }

        let (connd_tx, connd_rx) = unbounded();
        let (reaper_tx, reaper_rx) = unbounded();
        let shared = Arc::new(Self {
            pool: TxPool::new(config.ntx, config.ntx_nblk),
            config,
            fabric,
            upper,
            table: ConnTable::default(),
            devices,
            stamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_micros() as u64),
            connd_tx,
            reaper_tx,
            map_waiters: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        Ok((shared, WorkerQueues { connd_rx, reaper_rx }))
    }

    pub fn nid(&self) -> Nid {
        self.config.nid
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn tx_done(&self, tx: Box<Tx>, status: Result<()>) {
        let mapped = matches!(tx.buf_type(), BufType::VirtMapped | BufType::PhysMapped);
        tx::tx_done(&self.pool, self.fabric.as_ref(), tx, status);
        if mapped && self.map_waiters.swap(false, Ordering::SeqCst) {
            debug!("Registration freed, rescheduling connections");
            self.schedule_all();
        }
    }

    pub fn fail_txs(&self, txs: Vec<Box<Tx>>, reason: NalError) {
        for tx in txs {
            self.tx_done(tx, Err(reason.clone()));
        }
    }

    /// Queue on a connection and schedule it; fails the descriptor if
    /// the connection has started closing
    pub fn post_fma(&self, conn: &Arc<Conn>, tx: Box<Tx>) {
        match conn.enqueue_fma(tx) {
            Ok(()) => self.schedule_conn(conn),
            Err(tx) => {
                debug!("Connection to {:#x} closing, failing {:?}", conn.peer_nid, tx);
                self.tx_done(tx, Err(NalError::ConnectionClosed(conn.peer_nid)));
            }
        }
    }

    /// Route a prepared descriptor to `nid`: onto a live connection, or
    /// onto the peer's queue with a connection attempt in flight
    pub fn launch_tx(&self, tx: Box<Tx>, nid: Nid) -> Result<()> {
        let conn = self.table.read().find_conn(nid);
        let tx = match conn {
            Some(conn) => match conn.enqueue_fma(tx) {
                Ok(()) => {
                    self.schedule_conn(&conn);
                    return Ok(());
                }
                Err(tx) => tx,
            },
            None => tx,
        };

        let mut table = self.table.write();

        // Retry under the write lock; a connection may have been installed
        let tx = match table.find_conn(nid) {
            Some(conn) => match conn.enqueue_fma(tx) {
                Ok(()) => {
                    drop(table);
                    self.schedule_conn(&conn);
                    return Ok(());
                }
                Err(tx) => tx,
            },
            None => tx,
        };

        let interval = self.config.min_reconnect_interval();
        let peer = table
            .peers
            .entry(nid)
            .or_insert_with(|| Peer::new(nid, None, 1, interval));

        if !peer.connecting {
            if peer.in_backoff(Instant::now()) {
                drop(table);
                debug!("Peer {:#x} in reconnect backoff", nid);
                tx::tx_discard(&self.pool, self.fabric.as_ref(), tx);
                return Err(NalError::HostUnreachable(nid));
            }

            if self.connd_tx.send(nid).is_err() {
                drop(table);
                tx::tx_discard(&self.pool, self.fabric.as_ref(), tx);
                return Err(NalError::Shutdown);
            }
            peer.connecting = true;
        }

        peer.tx_queue.push_back(tx);
        Ok(())
    }

    pub fn close_conn(&self, conn: &Arc<Conn>, reason: NalError) {
        let failed = self.table.write().close_conn(conn, reason.clone());
        self.fail_txs(failed, reason);
        self.schedule_conn(conn);
    }

    pub fn terminate_conn(&self, conn: &Arc<Conn>) {
        let failed = self.table.write().terminate_conn(conn);
        let reason = conn
            .lock()
            .close_reason
            .clone()
            .unwrap_or(NalError::ConnectionClosed(conn.peer_nid));
        self.fail_txs(failed, reason);
    }

    fn set_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }
}

/// A running NAL instance
pub struct Nal {
    shared: Arc<NalShared>,
    threads: Vec<JoinHandle<()>>,
    /// Dropped to stop the connect daemon, acceptor and reaper
    stop_tx: Option<Sender<()>>,
}

impl Nal {
    /// Start the schedulers, connect daemon, acceptor and reaper
    pub fn startup(config: NalConfig, fabric: Arc<dyn Fabric>, upper: Arc<dyn Upper>) -> Result<Self> {
        let (shared, queues) = NalShared::new(config, fabric, upper)?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let mut nal = Self {
            shared: shared.clone(),
            threads: Vec::new(),
            stop_tx: Some(stop_tx),
        };

        for dev in &shared.devices {
            let (nal_shared, dev) = (shared.clone(), dev.clone());
            nal.spawn(format!("ranal_sd_{:02}", dev.idx), move || {
                scheduler::run_scheduler(nal_shared, dev)
            })?;
        }

        let (connd_shared, connd_stop) = (shared.clone(), stop_rx.clone());
        let connd_rx = queues.connd_rx;
        nal.spawn("ranal_connd".to_string(), move || {
            connd::run_connd(connd_shared, connd_rx, connd_stop)
        })?;

        let (accept_shared, accept_stop) = (shared.clone(), stop_rx.clone());
        nal.spawn("ranal_accept".to_string(), move || {
            connd::run_acceptor(accept_shared, accept_stop)
        })?;

        let reaper_shared = shared.clone();
        let reaper_rx = queues.reaper_rx;
        nal.spawn("ranal_reaper".to_string(), move || {
            reaper::run_reaper(reaper_shared, reaper_rx, stop_rx)
        })?;

        info!(
            "NAL {:#x} started: {} device(s), {}+{} descriptors",
            shared.nid(),
            shared.devices.len(),
            shared.config.ntx,
            shared.config.ntx_nblk
        );
        Ok(nal)
    }

    fn spawn(&mut self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| NalError::Spawn(format!("{}: {}", name, e)))?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn nid(&self) -> Nid {
        self.shared.nid()
    }

    /// Send a message with an optional payload
    ///
    /// On `Ok` the completion fires exactly once; on `Err` it never
    /// fires.
    pub fn send(&self, req: SendRequest, completion: Completion) -> Result<()> {
        self.check_request(&req)?;

        let immediate = matches!(req.payload, Payload::Iov(_) | Payload::None)
            && req.len <= self.shared.config.max_immediate;

        let buffer = if immediate {
            match &req.payload {
                Payload::Iov(iov) => Buffer::immediate(iov, req.offset, req.len)?,
                _ => Buffer::setup(&req.payload, req.offset, req.len, 0)?,
            }
        } else {
            Buffer::setup(
                &req.payload,
                req.offset,
                req.len,
                self.shared.config.max_phys_regions,
            )?
        };

        let mut tx = self.shared.pool.acquire(req.may_block)?;
        tx.buffer = buffer;
        tx.msg = Some(if immediate {
            MsgBody::Immediate {
                hdr: req.hdr,
                payload: Vec::new(),
            }
        } else {
            MsgBody::PutReq {
                hdr: req.hdr,
                cookie: 0,
            }
        });
        tx.completions[0] = Some(completion);

        debug!("Sending {:?} to {:#x}, {} bytes", tx.msg_type(), req.nid, req.len);
        self.shared.launch_tx(tx, req.nid)
    }

    /// Fetch `len` bytes from `req.nid` into the request's payload
    ///
    /// `completion` and `reply` both fire once the data has landed or
    /// the GET has failed.
    pub fn send_get(&self, req: SendRequest, completion: Completion, reply: Completion) -> Result<()> {
        self.check_request(&req)?;

        let buffer = Buffer::setup(
            &req.payload,
            req.offset,
            req.len,
            self.shared.config.max_phys_regions,
        )?;

        let mut tx = self.shared.pool.acquire(req.may_block)?;
        tx.buffer = buffer;
        tx.msg = Some(MsgBody::GetReq {
            hdr: req.hdr,
            cookie: 0,
            desc: Default::default(),
        });
        tx.completions = [Some(completion), Some(reply)];

        debug!("GET from {:#x}, {} bytes", req.nid, req.len);
        self.shared.launch_tx(tx, req.nid)
    }

    fn check_request(&self, req: &SendRequest) -> Result<()> {
        if self.shared.is_shutdown() {
            return Err(NalError::Shutdown);
        }
        if req.nid == self.nid() {
            return Err(NalError::HostUnreachable(req.nid));
        }
        if req.hdr.len() > MAX_UPPER_HDR {
            return Err(NalError::MessageTooLarge {
                size: req.hdr.len(),
                max: MAX_UPPER_HDR,
            });
        }
        let available = req.payload.total_len();
        if req.offset.checked_add(req.len).map_or(true, |end| end > available) {
            return Err(NalError::Fragmented(format!(
                "{} bytes at offset {} exceed payload of {}",
                req.len, req.offset, available
            )));
        }
        Ok(())
    }

    /// Make a peer reachable, optionally at a fixed address
    pub fn add_peer(&self, nid: Nid, addr: Option<String>) {
        info!("Adding peer {:#x} at {:?}", nid, addr);
        self.shared
            .table
            .write()
            .add_peer(nid, addr, self.shared.config.min_reconnect_interval());
    }

    /// Forget a peer: close its connections and fail anything queued
    pub fn del_peer(&self, nid: Nid) -> Result<()> {
        let Some(failed) = self.shared.table.write().del_peer(nid) else {
            return Err(NalError::HostUnreachable(nid));
        };
        info!("Deleted peer {:#x}", nid);
        self.shared.fail_txs(failed, NalError::ConnectionClosed(nid));
        self.shared.schedule_all();
        Ok(())
    }

    /// Close every connection to a peer; returns how many were closed
    pub fn close_peer(&self, nid: Nid) -> usize {
        let conns = match self.shared.table.read().peers.get(&nid) {
            Some(peer) => peer.conns.clone(),
            None => return 0,
        };
        for conn in &conns {
            self.shared.close_conn(conn, NalError::ConnectionClosed(nid));
        }
        conns.len()
    }

    pub fn peer_info(&self, nid: Nid) -> Option<PeerInfo> {
        self.shared.table.read().peer_info(nid)
    }

    /// Connections to `nid`, including ones still closing
    pub fn conn_info(&self, nid: Nid) -> Vec<ConnInfo> {
        self.shared
            .table
            .read()
            .conns
            .values()
            .filter(|c| c.peer_nid == nid)
            .map(|c| c.info())
            .collect()
    }

    /// Idle descriptors as (general, reserved)
    pub fn idle_descriptors(&self) -> (usize, usize) {
        self.shared.pool.idle_count()
    }

    /// Stop all threads, terminate every connection and fail whatever is
    /// still queued
    pub fn shutdown(&mut self) {
        if !self.shared.set_shutdown() {
            return;
        }
        info!("Shutting down NAL {:#x}", self.nid());

        self.shared.pool.shutdown();
        for dev in &self.shared.devices {
            dev.wake_all();
        }
        self.stop_tx.take();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("NAL worker thread panicked");
            }
        }

        let (conns, queued) = {
            let mut table = self.shared.table.write();
            let conns = table.conns.values().cloned().collect::<Vec<_>>();
            let queued = table
                .peers
                .values_mut()
                .flat_map(|p| p.tx_queue.drain(..))
                .collect::<Vec<_>>();
            (conns, queued)
        };
        for conn in &conns {
            conn.lock().close_reason = Some(NalError::Shutdown);
            self.shared.terminate_conn(conn);
        }
        self.shared.fail_txs(queued, NalError::Shutdown);
        self.shared.table.write().peers.clear();

        self.shared.fabric.shutdown();
        let (idle, idle_nblk) = self.shared.pool.idle_count();
        if idle + idle_nblk != self.shared.config.ntx + self.shared.config.ntx_nblk {
            warn!(
                "{} descriptors still outstanding at shutdown",
                self.shared.config.ntx + self.shared.config.ntx_nblk - idle - idle_nblk
            );
        }
    }
}

impl Drop for Nal {
    fn drop(&mut self) {
        self.shutdown();
    }
}
