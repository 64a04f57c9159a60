//! Upper-layer (RPC) interface
//!
//! The NAL calls into the layer above it when a message arrives. Matching
//! is entirely up to that layer; the NAL only moves bytes.

use crate::buffer::Payload;
use crate::tx::Completion;
use crate::Nid;

/// Local memory the upper layer matched to an incoming PUT or GET
///
/// For a PUT it is the sink the data lands in; for a GET it is the
/// source the reply is read from. `completion` fires once the transfer
/// has finished or failed.
#[derive(Debug)]
pub struct Matched {
    pub payload: Payload,
    pub offset: usize,
    pub len: usize,
    pub completion: Completion,
}

pub trait Upper: Send + Sync {
    /// A complete message with its payload
    fn recv_immediate(&self, src: Nid, hdr: &[u8], payload: &[u8]);

    /// Find the sink for a PUT; `None` refuses it
    fn match_put(&self, src: Nid, hdr: &[u8]) -> Option<Matched>;

    /// Find the source for a GET whose sink holds `sink_len` bytes;
    /// `None` refuses it
    fn match_get(&self, src: Nid, hdr: &[u8], sink_len: usize) -> Option<Matched>;
}
