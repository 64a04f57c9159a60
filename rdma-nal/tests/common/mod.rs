#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rdma_nal::{Completion, Iov, Kiov, Matched, Nid, Payload, Result, Segment, Upper, PAGE_SIZE};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub type Delivery = (Nid, Vec<u8>, Vec<u8>);

/// Route library logs through the test harness; `RUST_LOG` selects the level
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Upper layer that reports deliveries on a channel and serves buffers
/// offered ahead of time
pub struct TestUpper {
    delivered: Sender<Delivery>,
    sinks: Mutex<VecDeque<Matched>>,
    sources: Mutex<VecDeque<Matched>>,
}

impl TestUpper {
    pub fn new() -> (Arc<Self>, Receiver<Delivery>) {
        let (delivered, rx) = unbounded();
        let upper = Arc::new(Self {
            delivered,
            sinks: Mutex::new(VecDeque::new()),
            sources: Mutex::new(VecDeque::new()),
        });
        (upper, rx)
    }

    fn matched(seg: &Segment) -> (Matched, Receiver<Result<()>>) {
        let (completion, rx) = Completion::channel();
        let m = Matched {
            payload: Payload::Iov(vec![Iov::whole(seg.clone())]),
            offset: 0,
            len: seg.len(),
            completion,
        };
        (m, rx)
    }

    pub fn offer_sink(&self, seg: &Segment) -> Receiver<Result<()>> {
        let (m, rx) = Self::matched(seg);
        self.sinks.lock().push_back(m);
        rx
    }

    pub fn offer_source(&self, seg: &Segment) -> Receiver<Result<()>> {
        let (m, rx) = Self::matched(seg);
        self.sources.lock().push_back(m);
        rx
    }
}

impl Upper for TestUpper {
    fn recv_immediate(&self, src: Nid, hdr: &[u8], payload: &[u8]) {
        let _ = self.delivered.send((src, hdr.to_vec(), payload.to_vec()));
    }

    fn match_put(&self, _src: Nid, _hdr: &[u8]) -> Option<Matched> {
        self.sinks.lock().pop_front()
    }

    fn match_get(&self, _src: Nid, _hdr: &[u8], _sink_len: usize) -> Option<Matched> {
        self.sources.lock().pop_front()
    }
}

pub fn patterned(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ salt).collect()
}

/// Whole pages holding `data`, zero padded
pub fn pages_of(data: &[u8]) -> (Vec<Segment>, Payload) {
    let pages = data
        .chunks(PAGE_SIZE)
        .map(|chunk| {
            let page = Segment::page();
            page.write(0, chunk).unwrap();
            page
        })
        .collect::<Vec<_>>();
    let kiov = pages
        .iter()
        .map(|p| Kiov {
            page: p.clone(),
            offset: 0,
            len: PAGE_SIZE,
        })
        .collect();
    (pages, Payload::Pages(kiov))
}

pub fn iov_of(seg: &Segment) -> Payload {
    Payload::Iov(vec![Iov::whole(seg.clone())])
}

pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
