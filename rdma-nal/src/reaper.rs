//! Connection reaper
//!
//! Scans every connection often enough that each is checked
//! `reaper_checks_per_timeout` times within the shortest timeout or
//! keepalive in use, but never more often than `reaper_period`.

use crate::conn::{Conn, ConnState};
use crate::error::NalError;
use crate::NalShared;
use crossbeam_channel::{select, Receiver};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn scan_interval(min_timeout: Duration, period: Duration, checks: u32) -> Duration {
    (min_timeout / checks.max(1)).max(period)
}

/// Age of the oldest descriptor across the three queues
fn oldest_queued(conn: &Conn, now: Instant) -> Duration {
    let inner = conn.lock();
    [&inner.fmaq, &inner.rdmaq, &inner.replyq]
        .into_iter()
        .filter_map(|q| q.front())
        .map(|tx| now.saturating_duration_since(tx.qtime))
        .max()
        .unwrap_or_default()
}

impl NalShared {
    /// Check one connection; `Ok(true)` when a keepalive is due
    fn check_conn(&self, conn: &Conn, now: Instant) -> Result<bool, NalError> {
        let (state, last_rx, last_tx) = {
            let inner = conn.lock();
            (inner.state, inner.last_rx, inner.last_tx)
        };

        let timeout = match state {
            ConnState::Active => conn.timeout,
            ConnState::Closing => conn.timeout * 2,
            ConnState::Establishing | ConnState::Closed => return Ok(false),
        };

        let silent = now.saturating_duration_since(last_rx);
        if silent > timeout {
            warn!(
                "Timed out {} connection to {:#x}: nothing received for {:?}",
                if state == ConnState::Active { "active" } else { "closing" },
                conn.peer_nid,
                silent
            );
            return Err(NalError::Timeout);
        }

        let age = oldest_queued(conn, now);
        if age > timeout {
            warn!(
                "Timed out connection to {:#x}: descriptor queued for {:?}",
                conn.peer_nid, age
            );
            return Err(NalError::Timeout);
        }

        Ok(now.saturating_duration_since(last_tx) >= conn.keepalive)
    }

    /// One scan over every connection; returns the shortest timeout or
    /// keepalive among the survivors
    fn check_conns(&self) -> Option<Duration> {
        let conns = self.table.read().conns.values().cloned().collect::<Vec<Arc<Conn>>>();
        let now = Instant::now();
        let mut shortest: Option<Duration> = None;

        for conn in &conns {
            match self.check_conn(conn, now) {
                Ok(keepalive) => {
                    if keepalive {
                        debug!("Keepalive due on {:#x}", conn.peer_nid);
                        self.schedule_conn(conn);
                    }
                    let t = conn.timeout.min(conn.keepalive);
                    shortest = Some(shortest.map_or(t, |s| s.min(t)));
                }
                Err(e) => {
                    if conn.lock().is_closing() {
                        self.terminate_conn(conn);
                    } else {
                        self.close_conn(conn, e);
                    }
                }
            }
        }
        shortest
    }
}

pub(crate) fn run_reaper(nal: Arc<NalShared>, timeouts: Receiver<Duration>, stop: Receiver<()>) {
    info!("Reaper started");

    let default_timeout = nal.config.timeout().min(nal.config.keepalive());
    let period = nal.config.reaper_period();
    let checks = nal.config.reaper_checks_per_timeout;

    let mut min_timeout = default_timeout;
    let mut deadline = Instant::now() + scan_interval(min_timeout, period, checks);

    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        select! {
            recv(stop) -> _ => break,
            recv(timeouts) -> t => match t {
                Ok(t) if t < min_timeout => {
                    min_timeout = t;
                    deadline = deadline.min(Instant::now() + scan_interval(min_timeout, period, checks));
                }
                Ok(_) => {}
                Err(_) => break,
            },
            default(wait) => {
                min_timeout = nal.check_conns().unwrap_or(default_timeout);
                deadline = Instant::now() + scan_interval(min_timeout, period, checks);
            }
        }
    }

    info!("Reaper stopped");
}
