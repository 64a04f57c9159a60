//! Fabric abstraction
//!
//! The NAL never talks to NIC hardware directly. A [`Fabric`] offers the
//! capabilities the engine needs: memory registration, connection
//! handshakes, credit-backed short message sends (FMA), RDMA posts and
//! per-device completion queues with an asynchronous "device ready"
//! callback.
//!
//! Providers:
//! - [`loopback`]: in-process fabric for tests and single-host runs
//! - [`tcp`]: TCP fabric that emulates FMA and RDMA over sockets

pub mod loopback;
pub mod tcp;

use crate::buffer::Segment;
use crate::wire::{MemKey, RdmaDesc};
use crate::{Nid, PAGE_SIZE};
use crossbeam_channel::Receiver;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type DeviceId = u32;

/// Invoked by the fabric whenever a device's completion queues gain entries
pub type DeviceCallback = Arc<dyn Fn(DeviceId) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("No registration resources left")]
    NoResources,

    #[error("Memory key {0:#x} not registered")]
    NotRegistered(u64),

    #[error("Access outside registered region: offset {offset}, len {len}, region size {size}")]
    OutOfBounds { offset: u64, len: usize, size: usize },

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Can't resolve address of node {0:#x}")]
    Unresolved(Nid),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Endpoint closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result of an FMA send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmaSend {
    Sent,
    /// Out of FMA credits; the fabric raises an FMA completion on this
    /// endpoint's cqid when credits return
    NoCredits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEvent {
    pub cqid: u32,
    /// Events were lost; every connection on the device must be checked
    pub overrun: bool,
}

/// Memory handed to the fabric for registration
#[derive(Clone)]
pub enum MemRegion {
    /// Contiguous range of one segment
    Virt {
        seg: Segment,
        offset: usize,
        len: usize,
    },
    /// Whole pages, addressed by byte offset from the start of the first
    Phys { pages: Vec<Segment> },
}

impl MemRegion {
    /// Address the first byte of this region is advertised at
    pub fn base(&self) -> u64 {
        match self {
            MemRegion::Virt { seg, offset, .. } => seg.addr() + *offset as u64,
            MemRegion::Phys { .. } => 0,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MemRegion::Virt { len, .. } => *len,
            MemRegion::Phys { pages } => pages.len() * PAGE_SIZE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, off: u64, len: usize) -> Result<usize, FabricError> {
        let size = self.len();
        match off.checked_add(len as u64) {
            Some(end) if end <= size as u64 => Ok(off as usize),
            _ => Err(FabricError::OutOfBounds {
                offset: off,
                len,
                size,
            }),
        }
    }

    pub fn write_at(&self, off: u64, data: &[u8]) -> Result<(), FabricError> {
        let off = self.check(off, data.len())?;
        match self {
            MemRegion::Virt { seg, offset, .. } => seg.write(offset + off, data),
            MemRegion::Phys { pages } => {
                let mut done = 0;
                while done < data.len() {
                    let pos = off + done;
                    let in_page = pos % PAGE_SIZE;
                    let n = (PAGE_SIZE - in_page).min(data.len() - done);
                    pages[pos / PAGE_SIZE].write(in_page, &data[done..done + n])?;
                    done += n;
                }
                Ok(())
            }
        }
    }

    pub fn read_at(&self, off: u64, len: usize) -> Result<Vec<u8>, FabricError> {
        let off = self.check(off, len)?;
        match self {
            MemRegion::Virt { seg, offset, .. } => seg.read(offset + off, len),
            MemRegion::Phys { pages } => {
                let mut out = Vec::with_capacity(len);
                while out.len() < len {
                    let pos = off + out.len();
                    let in_page = pos % PAGE_SIZE;
                    let n = (PAGE_SIZE - in_page).min(len - out.len());
                    out.extend(pages[pos / PAGE_SIZE].read(in_page, n)?);
                }
                Ok(out)
            }
        }
    }
}

/// One RDMA transfer from a locally registered buffer to a remote one
#[derive(Debug, Clone, Copy)]
pub struct RdmaPost {
    /// Returned by [`Endpoint::rdma_done`] when the transfer completes
    pub app_id: u64,
    pub src_key: MemKey,
    pub src_addr: u64,
    pub dst: RdmaDesc,
    pub nob: usize,
}

/// Connection handshake exchanged by both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u16,
    pub src_nid: Nid,
    pub dst_nid: Nid,
    /// Chosen by the active side, adopted by the passive side
    pub incarnation: u64,
    /// First sequence number the sender of this hello will use
    pub initial_seq: u32,
    pub timeout_secs: u32,
    /// Start time of the sender's NAL instance; changes when it restarts
    pub stamp: u64,
}

/// A connection request that arrived from a remote node
pub struct Incoming {
    pub endpoint: Arc<dyn Endpoint>,
    pub hello: Hello,
    reply: Box<dyn FnOnce(Option<Hello>) + Send>,
}

impl Incoming {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        hello: Hello,
        reply: impl FnOnce(Option<Hello>) + Send + 'static,
    ) -> Self {
        Self {
            endpoint,
            hello,
            reply: Box::new(reply),
        }
    }

    /// Complete the handshake and hand back the endpoint
    pub fn accept(self, hello: Hello) -> Arc<dyn Endpoint> {
        (self.reply)(Some(hello));
        self.endpoint
    }

    pub fn reject(self) {
        (self.reply)(None);
        self.endpoint.close();
    }
}

/// Downstream capability consumed by the NAL
pub trait Fabric: Send + Sync {
    fn devices(&self) -> Vec<DeviceId>;

    fn set_device_callback(&self, dev: DeviceId, cb: DeviceCallback) -> Result<(), FabricError>;

    fn register(&self, dev: DeviceId, region: MemRegion) -> Result<MemKey, FabricError>;

    fn deregister(&self, dev: DeviceId, key: MemKey) -> Result<(), FabricError>;

    /// Transport address of a node that has no configured address
    fn resolve(&self, nid: Nid) -> Result<String, FabricError>;

    /// Active handshake; blocks for at most `timeout`
    fn connect(
        &self,
        dev: DeviceId,
        addr: &str,
        hello: Hello,
        timeout: Duration,
    ) -> Result<(Arc<dyn Endpoint>, Hello), FabricError>;

    /// Passive handshakes, serviced by the connect daemon
    fn incoming(&self) -> Receiver<Incoming>;

    fn poll_rdma_cq(&self, dev: DeviceId) -> Option<CqEvent>;

    fn poll_fma_cq(&self, dev: DeviceId) -> Option<CqEvent>;

    fn shutdown(&self) {}
}

/// One side of an established fabric connection
pub trait Endpoint: Send + Sync {
    /// Completion queue id, unique per fabric instance
    fn cqid(&self) -> u32;

    fn device(&self) -> DeviceId;

    /// Send one short message. `fence` requests a synchronous send that
    /// is ordered after every RDMA previously posted on this endpoint.
    fn fma_send(&self, msg: &[u8], fence: bool) -> Result<FmaSend, FabricError>;

    /// Next inbound message, if any
    fn fma_recv(&self) -> Option<Vec<u8>>;

    /// Wait for RDMA that a fenced message announced
    fn fence_wait(&self) {}

    fn post_rdma(&self, post: RdmaPost) -> Result<(), FabricError>;

    /// Next completed RDMA on this endpoint
    fn rdma_done(&self) -> Option<u64>;

    fn close(&self);
}

struct Registered {
    dev: DeviceId,
    key: MemKey,
    region: MemRegion,
}

/// Registered memory regions of one fabric instance, keyed by `MemKey.key`
pub struct MemoryRegistry {
    regions: Mutex<HashMap<u64, Registered>>,
    next_key: AtomicU64,
    limit: usize,
}

impl MemoryRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            limit,
        }
    }

    pub fn register(&self, dev: DeviceId, region: MemRegion) -> Result<MemKey, FabricError> {
        let mut regions = self.regions.lock();
        if regions.len() >= self.limit {
            return Err(FabricError::NoResources);
        }

        let id = self.next_key.fetch_add(1, Ordering::Relaxed);
        let key = MemKey {
            key: id,
            cookie: (id as u16) ^ 0x5a5a,
            md_handle: (dev & 0xffff) as u16,
            flags: 0,
        };
        regions.insert(id, Registered { dev, key, region });
        Ok(key)
    }

    pub fn deregister(&self, key: MemKey) -> Result<(), FabricError> {
        let mut regions = self.regions.lock();
        match regions.get(&key.key) {
            Some(r) if r.key == key => {
                regions.remove(&key.key);
                Ok(())
            }
            _ => Err(FabricError::NotRegistered(key.key)),
        }
    }

    fn lookup(&self, key: &MemKey) -> Result<MemRegion, FabricError> {
        match self.regions.lock().get(&key.key) {
            Some(r) if r.key == *key => Ok(r.region.clone()),
            _ => Err(FabricError::NotRegistered(key.key)),
        }
    }

    /// Write at an advertised address within a registered region
    pub fn write(&self, key: &MemKey, addr: u64, data: &[u8]) -> Result<(), FabricError> {
        let region = self.lookup(key)?;
        let off = addr.wrapping_sub(region.base());
        region.write_at(off, data)
    }

    pub fn read(&self, key: &MemKey, addr: u64, len: usize) -> Result<Vec<u8>, FabricError> {
        let region = self.lookup(key)?;
        let off = addr.wrapping_sub(region.base());
        region.read_at(off, len)
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Regions registered on one device
    pub fn count_on(&self, dev: DeviceId) -> usize {
        self.regions.lock().values().filter(|r| r.dev == dev).count()
    }
}

struct CompletionQueue {
    events: VecDeque<u32>,
    capacity: usize,
    overrun: bool,
}

impl CompletionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            overrun: false,
        }
    }

    fn push(&mut self, cqid: u32) {
        if self.events.len() >= self.capacity {
            self.overrun = true;
        } else {
            self.events.push_back(cqid);
        }
    }

    fn pop(&mut self) -> Option<CqEvent> {
        if self.overrun {
            self.overrun = false;
            return Some(CqEvent {
                cqid: 0,
                overrun: true,
            });
        }
        self.events.pop_front().map(|cqid| CqEvent {
            cqid,
            overrun: false,
        })
    }
}

/// Completion queues and ready callback of one fabric device
pub(crate) struct DeviceQueues {
    pub id: DeviceId,
    callback: Mutex<Option<DeviceCallback>>,
    rdma_cq: Mutex<CompletionQueue>,
    fma_cq: Mutex<CompletionQueue>,
}

impl DeviceQueues {
    pub fn new(id: DeviceId, cq_capacity: usize) -> Self {
        Self {
            id,
            callback: Mutex::new(None),
            rdma_cq: Mutex::new(CompletionQueue::new(cq_capacity)),
            fma_cq: Mutex::new(CompletionQueue::new(cq_capacity)),
        }
    }

    pub fn set_callback(&self, cb: DeviceCallback) {
        *self.callback.lock() = Some(cb);
    }

    fn notify(&self) {
        let cb = self.callback.lock().clone();
        match cb {
            Some(cb) => cb(self.id),
            None => warn!("Completion on device {} with no callback installed", self.id),
        }
    }

    pub fn raise_rdma(&self, cqid: u32) {
        self.rdma_cq.lock().push(cqid);
        self.notify();
    }

    pub fn raise_fma(&self, cqid: u32) {
        self.fma_cq.lock().push(cqid);
        self.notify();
    }

    pub fn poll_rdma(&self) -> Option<CqEvent> {
        self.rdma_cq.lock().pop()
    }

    pub fn poll_fma(&self) -> Option<CqEvent> {
        self.fma_cq.lock().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_virt_roundtrip() {
        let reg = MemoryRegistry::new(4);
        let seg = Segment::new(128);
        let key = reg
            .register(
                0,
                MemRegion::Virt {
                    seg: seg.clone(),
                    offset: 32,
                    len: 64,
                },
            )
            .unwrap();

        let base = seg.addr() + 32;
        reg.write(&key, base + 8, b"hello").unwrap();
        assert_eq!(seg.read(40, 5).unwrap(), b"hello");
        assert_eq!(reg.read(&key, base + 8, 5).unwrap(), b"hello");

        let err = reg.write(&key, base + 60, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, FabricError::OutOfBounds { .. }));
    }

    #[test]
    fn test_registry_phys_spans_pages() {
        let reg = MemoryRegistry::new(4);
        let pages = vec![Segment::new(PAGE_SIZE), Segment::new(PAGE_SIZE)];
        let key = reg
            .register(1, MemRegion::Phys { pages: pages.clone() })
            .unwrap();

        let data = vec![7u8; 100];
        reg.write(&key, PAGE_SIZE as u64 - 50, &data).unwrap();
        assert_eq!(pages[0].read(PAGE_SIZE - 50, 50).unwrap(), vec![7u8; 50]);
        assert_eq!(pages[1].read(0, 50).unwrap(), vec![7u8; 50]);
        assert_eq!(reg.count_on(1), 1);
    }

    #[test]
    fn test_deregister_twice_is_rejected() {
        let reg = MemoryRegistry::new(4);
        let key = reg
            .register(0, MemRegion::Phys { pages: vec![Segment::new(PAGE_SIZE)] })
            .unwrap();
        let other = reg
            .register(0, MemRegion::Phys { pages: vec![Segment::new(PAGE_SIZE)] })
            .unwrap();

        assert!(reg.deregister(key).is_ok());
        assert_eq!(reg.deregister(key), Err(FabricError::NotRegistered(key.key)));
        assert_eq!(reg.len(), 1);
        assert!(reg.read(&other, 0, 16).is_ok());
    }

    #[test]
    fn test_registration_limit() {
        let reg = MemoryRegistry::new(1);
        let region = MemRegion::Phys { pages: vec![Segment::new(PAGE_SIZE)] };
        reg.register(0, region.clone()).unwrap();
        assert_eq!(reg.register(0, region), Err(FabricError::NoResources));
    }

    #[test]
    fn test_stale_key_cookie_rejected() {
        let reg = MemoryRegistry::new(2);
        let mut key = reg
            .register(0, MemRegion::Phys { pages: vec![Segment::new(PAGE_SIZE)] })
            .unwrap();
        key.cookie ^= 1;
        assert!(matches!(reg.read(&key, 0, 1), Err(FabricError::NotRegistered(_))));
    }

    #[test]
    fn test_cq_overrun_reported_once() {
        let mut cq = CompletionQueue::new(1);
        cq.push(5);
        cq.push(6);
        assert_eq!(cq.pop(), Some(CqEvent { cqid: 0, overrun: true }));
        assert_eq!(cq.pop(), Some(CqEvent { cqid: 5, overrun: false }));
        assert_eq!(cq.pop(), None);
    }
}
