//! Per-device connection scheduler
//!
//! Each fabric device gets one thread. Fabric callbacks only set the
//! device's ready flag; the scheduler drains the completion queues,
//! then runs scheduled connections one pass at a time. A connection is
//! on at most one schedule queue at once, so only one thread ever works
//! a given connection.

use crate::conn::{Conn, ConnInner, ConnState};
use crate::error::NalError;
use crate::fabric::{DeviceId, FabricError, FmaSend};
use crate::wire::{MsgBody, MsgType};
use crate::NalShared;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

struct DevSched {
    ready: bool,
    connq: VecDeque<Arc<Conn>>,
}

pub(crate) struct Device {
    pub id: DeviceId,
    pub idx: usize,
    sched: Mutex<DevSched>,
    waitq: Condvar,
}

impl Device {
    pub fn new(id: DeviceId, idx: usize) -> Self {
        Self {
            id,
            idx,
            sched: Mutex::new(DevSched {
                // Drain anything that completed before the thread started
                ready: true,
                connq: VecDeque::new(),
            }),
            waitq: Condvar::new(),
        }
    }

    /// Fabric callback: completion queues have entries
    pub fn notify_ready(&self) {
        let mut sched = self.sched.lock();
        if !sched.ready {
            sched.ready = true;
            self.waitq.notify_one();
        }
    }

    pub fn wake_all(&self) {
        let _sched = self.sched.lock();
        self.waitq.notify_all();
    }

    #[cfg(test)]
    pub fn scheduled(&self) -> Vec<Arc<Conn>> {
        self.sched.lock().connq.iter().cloned().collect()
    }
}

impl NalShared {
    pub(crate) fn schedule_conn(&self, conn: &Arc<Conn>) {
        let dev = &self.devices[conn.dev_idx];
        let mut sched = dev.sched.lock();
        if !conn.scheduled.swap(true, Ordering::AcqRel) {
            sched.connq.push_back(conn.clone());
            self.devices[conn.dev_idx].waitq.notify_one();
        }
    }

    fn schedule_cqid(&self, cqid: u32) {
        let conn = self.table.read().conn_by_cqid(cqid);
        match conn {
            Some(conn) => self.schedule_conn(&conn),
            // Passive connection not installed yet; installing schedules it
            None => debug!("FMA completion for unknown cqid {}", cqid),
        }
    }

    /// Reschedule every connection on a device
    pub(crate) fn schedule_dev(&self, dev: &Device) {
        let conns = self.table.read().conns_on(dev.idx);
        for conn in &conns {
            self.schedule_conn(conn);
        }
    }

    pub(crate) fn schedule_all(&self) {
        for dev in &self.devices {
            self.schedule_dev(dev);
        }
    }

    /// Drain a device's completion queues; true if anything was found
    pub(crate) fn poll_device(&self, dev: &Device) -> bool {
        let mut busy = false;

        while let Some(ev) = self.fabric.poll_rdma_cq(dev.id) {
            busy = true;
            if ev.overrun {
                warn!("RDMA CQ overrun on device {}", dev.id);
                let conns = self.table.read().conns_on(dev.idx);
                for conn in &conns {
                    self.process_rdmaq(conn);
                }
                continue;
            }

            let conn = self.table.read().conn_by_cqid(ev.cqid);
            match conn {
                Some(conn) => self.process_rdmaq(&conn),
                None => warn!("RDMA completion for unknown cqid {}", ev.cqid),
            }
        }

        while let Some(ev) = self.fabric.poll_fma_cq(dev.id) {
            busy = true;
            if ev.overrun {
                warn!("FMA CQ overrun on device {}, rescheduling all connections", dev.id);
                self.schedule_dev(dev);
            } else {
                self.schedule_cqid(ev.cqid);
            }
        }

        busy
    }

    /// Move completed RDMA from the head of rdmaq onto fmaq so the
    /// matching DONE message goes out
    pub(crate) fn process_rdmaq(&self, conn: &Arc<Conn>) {
        let mut failed = Vec::new();
        let mut out_of_order = false;
        let reason = {
            let mut inner = conn.lock();
            while let Some(app_id) = conn.endpoint.rdma_done() {
                if inner.state == ConnState::Closed {
                    continue;
                }
                let Some(mut tx) = inner.rdmaq.pop_front() else {
                    error!(
                        "{:#x}: RDMA completion {:#x} with nothing outstanding",
                        conn.peer_nid, app_id
                    );
                    out_of_order = true;
                    break;
                };
                if tx.cookie != app_id {
                    error!(
                        "{:#x}: RDMA completion {:#x} doesn't match head {:#x}",
                        conn.peer_nid, app_id, tx.cookie
                    );
                    inner.rdmaq.push_front(tx);
                    out_of_order = true;
                    break;
                }

                if inner.is_closing() {
                    failed.push(tx);
                } else {
                    tx.qtime = Instant::now();
                    inner.fmaq.push_back(tx);
                }
            }
            inner
                .close_reason
                .clone()
                .unwrap_or(NalError::ConnectionClosed(conn.peer_nid))
        };

        self.fail_txs(failed, reason);
        if out_of_order {
            self.close_conn(conn, NalError::Protocol("RDMA completion out of order".into()));
        }
        self.schedule_conn(conn);
    }

    /// Send from the head of fmaq; true if more is queued
    pub(crate) fn process_fmaq(&self, conn: &Arc<Conn>) -> bool {
        let mut inner = conn.lock();
        match inner.state {
            ConnState::Active => {}
            ConnState::Closing => return self.process_closing(conn, inner),
            ConnState::Establishing | ConnState::Closed => return false,
        }

        let Some(mut tx) = inner.fmaq.pop_front() else {
            if inner.last_tx.elapsed() >= conn.keepalive {
                if let Err(e) = inner.sendmsg(conn, MsgBody::Noop) {
                    drop(inner);
                    self.close_conn(conn, e);
                }
            }
            return false;
        };

        let msg_type = tx.msg_type();
        if matches!(msg_type, Some(MsgType::PutReq | MsgType::GetReq)) {
            let dev = self.devices[conn.dev_idx].id;
            let mapped = tx.buffer.map(self.fabric.as_ref(), dev).or_else(|e| match e {
                FabricError::NoResources => {
                    // Flag first so a registration freed before the retry
                    // still reschedules us
                    self.map_waiters.store(true, Ordering::SeqCst);
                    tx.buffer.map(self.fabric.as_ref(), dev)
                }
                e => Err(e),
            });
            match mapped {
                Ok(()) => {}
                Err(FabricError::NoResources) => {
                    debug!("{:#x}: out of registrations, waiting for one", conn.peer_nid);
                    inner.fmaq.push_front(tx);
                    return false;
                }
                Err(e) => {
                    let more = !inner.fmaq.is_empty();
                    drop(inner);
                    error!("{:#x}: can't map buffer: {}", conn.peer_nid, e);
                    self.tx_done(tx, Err(e.into()));
                    return more;
                }
            }
        }

        let body = match tx.msg.as_ref() {
            Some(MsgBody::Immediate { hdr, .. }) => match tx.buffer.immediate_bytes() {
                Ok(payload) => MsgBody::Immediate {
                    hdr: hdr.clone(),
                    payload,
                },
                Err(e) => {
                    let more = !inner.fmaq.is_empty();
                    drop(inner);
                    self.tx_done(tx, Err(e));
                    return more;
                }
            },
            Some(MsgBody::PutReq { hdr, .. }) => MsgBody::PutReq {
                hdr: hdr.clone(),
                cookie: tx.cookie,
            },
            Some(MsgBody::GetReq { hdr, .. }) => MsgBody::GetReq {
                hdr: hdr.clone(),
                cookie: tx.cookie,
                desc: tx.buffer.desc().unwrap_or_default(),
            },
            Some(
                body @ (MsgBody::PutNak { .. }
                | MsgBody::PutAck { .. }
                | MsgBody::PutDone { .. }
                | MsgBody::GetNak { .. }
                | MsgBody::GetDone { .. }),
            ) => body.clone(),
            other => {
                let other = other.map(|m| m.msg_type());
                let more = !inner.fmaq.is_empty();
                drop(inner);
                error!("{:#x}: can't send {:?} from fmaq", conn.peer_nid, other);
                self.tx_done(tx, Err(NalError::Protocol(format!("bad fmaq entry {:?}", other))));
                return more;
            }
        };

        let expect_reply = matches!(
            body.msg_type(),
            MsgType::PutReq | MsgType::PutAck | MsgType::GetReq
        );

        match inner.sendmsg(conn, body) {
            Ok(FmaSend::Sent) => {
                let more = !inner.fmaq.is_empty();
                if expect_reply {
                    tx.qtime = Instant::now();
                    inner.replyq.push_back(tx);
                } else {
                    drop(inner);
                    self.tx_done(tx, Ok(()));
                }
                more
            }
            Ok(FmaSend::NoCredits) => {
                trace!("{:#x}: out of FMA credits", conn.peer_nid);
                inner.fmaq.push_front(tx);
                false
            }
            Err(e) => {
                drop(inner);
                error!("{:#x}: send failed: {}", conn.peer_nid, e);
                self.tx_done(tx, Err(e.clone()));
                self.close_conn(conn, e);
                false
            }
        }
    }

    /// Closing: keep the peer alive while RDMA drains, then send CLOSE once
    fn process_closing(&self, conn: &Arc<Conn>, mut inner: MutexGuard<'_, ConnInner>) -> bool {
        if !inner.rdmaq.is_empty() {
            if inner.last_tx.elapsed() >= conn.keepalive {
                if let Err(e) = inner.sendmsg(conn, MsgBody::Noop) {
                    debug!("{:#x}: NOOP while closing failed: {}", conn.peer_nid, e);
                }
            }
            return false;
        }
        if inner.close_sent {
            return false;
        }

        match inner.sendmsg(conn, MsgBody::Close) {
            Ok(FmaSend::Sent) => {
                inner.close_sent = true;
                let close_recvd = inner.close_recvd;
                drop(inner);
                debug!("{:#x}: CLOSE sent", conn.peer_nid);
                if close_recvd {
                    self.terminate_conn(conn);
                }
            }
            Ok(FmaSend::NoCredits) => {}
            Err(e) => {
                drop(inner);
                warn!("{:#x}: can't send CLOSE: {}", conn.peer_nid, e);
                self.terminate_conn(conn);
            }
        }
        false
    }
}

pub(crate) fn run_scheduler(nal: Arc<NalShared>, dev: Arc<Device>) {
    info!("Scheduler for device {} started", dev.id);

    let mut sched = dev.sched.lock();
    while !nal.is_shutdown() {
        let mut busy = false;

        if sched.ready {
            sched.ready = false;
            busy = MutexGuard::unlocked(&mut sched, || nal.poll_device(&dev));
        }

        if let Some(conn) = sched.connq.pop_front() {
            conn.scheduled.store(false, Ordering::Release);
            let more = MutexGuard::unlocked(&mut sched, || {
                let sent = nal.process_fmaq(&conn);
                let received = nal.process_receives(&conn);
                sent || received
            });
            if more && !conn.scheduled.swap(true, Ordering::AcqRel) {
                sched.connq.push_back(conn);
            }
            busy = true;
        }

        if !busy {
            dev.waitq.wait(&mut sched);
        }
    }

    info!("Scheduler for device {} stopped", dev.id);
}
