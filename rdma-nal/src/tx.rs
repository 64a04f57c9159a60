//! Transmit descriptors and the descriptor pool
//!
//! The pool holds two partitions: a general one that may block callers
//! and a reserve used only by callers that must not block. Each
//! descriptor records where it came from; releasing it anywhere else is
//! refused.

use crate::buffer::{BufType, Buffer};
use crate::conn::Conn;
use crate::error::{NalError, Result};
use crate::fabric::Fabric;
use crate::wire::{MsgBody, MsgType};
use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Finalizes one upper-layer operation exactly once
///
/// Locked so a pending completion can sit in the shared connection
/// table; only `fire` takes it.
pub struct Completion(Mutex<Box<dyn FnOnce(Result<()>) + Send>>);

impl Completion {
    pub fn new(f: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self(Mutex::new(Box::new(f)))
    }

    /// Completion that reports its status on a channel
    pub fn channel() -> (Self, Receiver<Result<()>>) {
        let (tx, rx) = bounded(1);
        let completion = Self::new(move |status| {
            let _ = tx.send(status);
        });
        (completion, rx)
    }

    pub(crate) fn fire(self, status: Result<()>) {
        (self.0.into_inner())(status)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// Transmit descriptor
pub struct Tx {
    slot: usize,
    pool_id: u64,
    nblk: bool,
    pub(crate) cookie: u64,
    pub(crate) msg: Option<MsgBody>,
    pub(crate) buffer: Buffer,
    pub(crate) conn: Option<Arc<Conn>>,
    pub(crate) completions: [Option<Completion>; 2],
    pub(crate) qtime: Instant,
}

impl Tx {
    fn new(slot: usize, pool_id: u64, nblk: bool) -> Self {
        Self {
            slot,
            pool_id,
            nblk,
            cookie: 0,
            msg: None,
            buffer: Buffer::None,
            conn: None,
            completions: [None, None],
            qtime: Instant::now(),
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn is_nblk(&self) -> bool {
        self.nblk
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.msg.as_ref().map(|m| m.msg_type())
    }

    pub fn buf_type(&self) -> BufType {
        self.buffer.buf_type()
    }

    fn is_idle(&self) -> bool {
        self.msg.is_none()
            && self.conn.is_none()
            && self.buffer.buf_type() == BufType::None
            && self.completions.iter().all(Option::is_none)
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("slot", &self.slot)
            .field("nblk", &self.nblk)
            .field("cookie", &self.cookie)
            .field("msg", &self.msg_type())
            .field("buf", &self.buf_type())
            .finish()
    }
}

struct PoolInner {
    idle: Vec<Box<Tx>>,
    idle_nblk: Vec<Box<Tx>>,
    in_pool: Vec<bool>,
    next_cookie: u64,
    shutdown: bool,
}

pub struct TxPool {
    id: u64,
    inner: Mutex<PoolInner>,
    idle_waitq: Condvar,
}

impl TxPool {
    pub fn new(ntx: usize, ntx_nblk: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let idle = (0..ntx).map(|slot| Box::new(Tx::new(slot, id, false))).collect();
        let idle_nblk = (ntx..ntx + ntx_nblk)
            .map(|slot| Box::new(Tx::new(slot, id, true)))
            .collect();

        Self {
            id,
            inner: Mutex::new(PoolInner {
                idle,
                idle_nblk,
                in_pool: vec![true; ntx + ntx_nblk],
                next_cookie: 1,
                shutdown: false,
            }),
            idle_waitq: Condvar::new(),
        }
    }

    /// Take an idle descriptor with a fresh cookie
    ///
    /// A caller that may block draws from the general partition and
    /// waits for it to refill. Any other caller draws from the reserve
    /// only and gets `NoSpace` when it is empty.
    pub fn acquire(&self, may_block: bool) -> Result<Box<Tx>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return Err(NalError::Shutdown);
            }

            let tx = if may_block {
                inner.idle.pop()
            } else {
                inner.idle_nblk.pop()
            };

            if let Some(mut tx) = tx {
                inner.in_pool[tx.slot] = false;
                tx.cookie = inner.next_cookie;
                inner.next_cookie = inner.next_cookie.wrapping_add(1).max(1);
                tx.qtime = Instant::now();
                return Ok(tx);
            }

            if !may_block {
                error!("Can't get non-blocking transmit descriptor");
                return Err(NalError::NoSpace);
            }

            debug!("Waiting for a transmit descriptor");
            self.idle_waitq.wait(&mut inner);
        }
    }

    /// Return a descriptor to the partition it came from
    pub fn release(&self, mut tx: Box<Tx>) -> Result<()> {
        let mut inner = self.inner.lock();

        if tx.pool_id != self.id {
            error!("Descriptor {:?} released into a foreign pool", tx);
            return Err(NalError::BadRelease(format!(
                "descriptor from pool {} released into pool {}",
                tx.pool_id, self.id
            )));
        }
        match inner.in_pool.get(tx.slot) {
            Some(false) => {}
            Some(true) => {
                error!("Descriptor {:?} released twice", tx);
                return Err(NalError::BadRelease(format!("slot {} already idle", tx.slot)));
            }
            None => {
                return Err(NalError::BadRelease(format!("slot {} out of range", tx.slot)));
            }
        }

        for c in tx.completions.iter_mut() {
            if c.take().is_some() {
                warn!("Descriptor {:#x} released with an unfired completion", tx.cookie);
            }
        }
        tx.msg = None;
        tx.conn = None;
        tx.cookie = 0;
        tx.buffer = Buffer::None;
        debug_assert!(tx.is_idle());

        inner.in_pool[tx.slot] = true;
        if tx.nblk {
            inner.idle_nblk.push(tx);
            return Ok(());
        }
        inner.idle.push(tx);
        drop(inner);

        self.idle_waitq.notify_one();
        Ok(())
    }

    /// Idle counts of (general, reserve)
    pub fn idle_count(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.idle.len(), inner.idle_nblk.len())
    }

    /// Fail all current and future blocking acquires
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.idle_waitq.notify_all();
    }
}

/// Finish a descriptor: unregister its memory, fire its completions with
/// `status` and return it to the pool
pub(crate) fn tx_done(pool: &TxPool, fabric: &dyn Fabric, mut tx: Box<Tx>, status: Result<()>) {
    tx.buffer.unmap(fabric);

    for c in tx.completions.iter_mut() {
        if let Some(c) = c.take() {
            c.fire(status.clone());
        }
    }

    if let Err(e) = pool.release(tx) {
        error!("Failed to release descriptor: {}", e);
    }
}

/// Give back a descriptor whose operation never started; its completions
/// are dropped without firing
pub(crate) fn tx_discard(pool: &TxPool, fabric: &dyn Fabric, mut tx: Box<Tx>) {
    tx.buffer.unmap(fabric);
    tx.completions = [None, None];
    if let Err(e) = pool.release(tx) {
        error!("Failed to release descriptor: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_partitions_are_separate() {
        let pool = TxPool::new(1, 1);
        let a = pool.acquire(true).unwrap();
        assert!(!a.is_nblk());
        let b = pool.acquire(false).unwrap();
        assert!(b.is_nblk());
        assert_eq!(pool.acquire(false).unwrap_err(), NalError::NoSpace);

        pool.release(b).unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.idle_count(), (1, 1));
    }

    #[test]
    fn test_exhausted_nonblocking_pool() {
        let pool = TxPool::new(2, 1);
        let _r = pool.acquire(false).unwrap();
        let start = Instant::now();
        let err = pool.acquire(false).unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(err, NalError::NoSpace);
        assert_eq!(err.errno(), libc::ENOMEM);
        // The general partition is untouched
        assert_eq!(pool.idle_count(), (2, 0));
    }

    #[test]
    fn test_blocking_never_takes_reserve() {
        let pool = Arc::new(TxPool::new(1, 4));
        let held = pool.acquire(true).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(true).map(|tx| tx.is_nblk()))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.idle_count(), (0, 4));
        pool.release(held).unwrap();

        let got_nblk = waiter.join().unwrap().unwrap();
        assert!(!got_nblk);
    }

    fn shareable<T: Send + Sync>() {}

    #[test]
    fn test_queued_work_is_shareable() {
        shareable::<Completion>();
        shareable::<Tx>();
        shareable::<crate::NalShared>();
    }

    #[test]
    fn test_cookies_strictly_increase() {
        let pool = TxPool::new(4, 1);
        let a = pool.acquire(true).unwrap();
        let b = pool.acquire(false).unwrap();
        assert!(b.cookie() > a.cookie());

        // A recycled descriptor gets a cookie newer than any issued
        pool.release(a).unwrap();
        let c = pool.acquire(true).unwrap();
        assert!(c.cookie() > b.cookie());

        pool.release(b).unwrap();
        pool.release(c).unwrap();
    }

    #[test]
    fn test_cookie_wrap_skips_zero() {
        let pool = TxPool::new(2, 0);
        pool.inner.lock().next_cookie = u64::MAX;

        let last = pool.acquire(true).unwrap();
        let wrapped = pool.acquire(true).unwrap();
        assert_eq!(last.cookie(), u64::MAX);
        assert_eq!(wrapped.cookie(), 1);

        pool.release(last).unwrap();
        pool.release(wrapped).unwrap();
    }

    #[test]
    fn test_release_into_foreign_pool_refused() {
        let pool = TxPool::new(1, 1);
        let other = TxPool::new(1, 1);
        let tx = pool.acquire(false).unwrap();

        let err = other.release(tx).unwrap_err();
        assert!(matches!(err, NalError::BadRelease(_)));
        assert_eq!(other.idle_count(), (1, 1));
        assert_eq!(pool.idle_count(), (0, 1));
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let pool = Arc::new(TxPool::new(0, 1));
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(true).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(NalError::Shutdown));
    }

    #[test]
    fn test_release_drops_unfired_completion() {
        let pool = TxPool::new(1, 0);
        let mut tx = pool.acquire(true).unwrap();
        let (completion, rx) = Completion::channel();
        tx.completions[0] = Some(completion);
        pool.release(tx).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
