//! Wire protocol
//!
//! Every message starts with a fixed 28-byte header followed by a
//! type-specific body:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic (0x0be91b92, also the byte-order marker)
//! 4       2     version
//! 6       2     type (bit 0x80 = FENCE)
//! 8       8     source nid
//! 16      8     connection incarnation
//! 24      4     sequence number
//! 28      ...   body
//! ```
//!
//! Messages are written little-endian. A receiver that sees the magic
//! byte-swapped decodes the whole message (including nested RDMA
//! descriptors) big-endian instead. Upper-layer headers are opaque and
//! never swapped.

use crate::Nid;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

pub const MSG_MAGIC: u32 = 0x0be9_1b92;
pub const MSG_VERSION: u16 = 1;

/// Set on messages that signal RDMA completion
pub const MSG_FENCE: u16 = 0x80;

pub const HEADER_SIZE: usize = 28;

/// Largest opaque upper-layer header carried in a message
pub const MAX_UPPER_HDR: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unexpected magic {0:#010x}")]
    BadMagic(u32),

    #[error("Unexpected protocol version {0}")]
    BadVersion(u16),

    #[error("Unknown message type {0:#x}")]
    UnknownType(u16),

    #[error("Truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Upper header too long: {0} bytes")]
    HeaderTooLong(usize),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("Unexpected source nid {got:#x} ({expected:#x} expected)")]
    WrongSource { expected: Nid, got: Nid },

    #[error("Unexpected incarnation {got:#x} ({expected:#x} expected)")]
    WrongIncarnation { expected: u64, got: u64 },

    #[error("Unexpected sequence number {got} ({expected} expected)")]
    WrongSequence { expected: u32, got: u32 },
}

impl WireError {
    /// Errors that desynchronise the connection's message stream
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::WrongIncarnation { .. } | WireError::WrongSequence { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Noop = 0x00,
    Immediate = 0x01,
    PutReq = 0x02,
    PutNak = 0x03,
    PutAck = 0x04,
    PutDone = 0x05 | MSG_FENCE,
    GetReq = 0x06,
    GetNak = 0x07,
    GetDone = 0x08 | MSG_FENCE,
    Close = 0x09,
}

impl MsgType {
    pub fn is_fenced(self) -> bool {
        (self as u16) & MSG_FENCE != 0
    }
}

impl TryFrom<u16> for MsgType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        Ok(match value {
            0x00 => MsgType::Noop,
            0x01 => MsgType::Immediate,
            0x02 => MsgType::PutReq,
            0x03 => MsgType::PutNak,
            0x04 => MsgType::PutAck,
            0x85 => MsgType::PutDone,
            0x06 => MsgType::GetReq,
            0x07 => MsgType::GetNak,
            0x88 => MsgType::GetDone,
            0x09 => MsgType::Close,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// Fabric memory registration key, as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemKey {
    pub key: u64,
    pub cookie: u16,
    pub md_handle: u16,
    pub flags: u32,
}

/// Remotely accessible buffer: where an RDMA transfer may land
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaDesc {
    pub key: MemKey,
    pub addr: u64,
    pub nob: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    Noop,
    Immediate { hdr: Vec<u8>, payload: Vec<u8> },
    PutReq { hdr: Vec<u8>, cookie: u64 },
    PutNak { cookie: u64 },
    PutAck { src_cookie: u64, dst_cookie: u64, desc: RdmaDesc },
    PutDone { cookie: u64 },
    GetReq { hdr: Vec<u8>, cookie: u64, desc: RdmaDesc },
    GetNak { cookie: u64 },
    GetDone { cookie: u64 },
    Close,
}

impl MsgBody {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MsgBody::Noop => MsgType::Noop,
            MsgBody::Immediate { .. } => MsgType::Immediate,
            MsgBody::PutReq { .. } => MsgType::PutReq,
            MsgBody::PutNak { .. } => MsgType::PutNak,
            MsgBody::PutAck { .. } => MsgType::PutAck,
            MsgBody::PutDone { .. } => MsgType::PutDone,
            MsgBody::GetReq { .. } => MsgType::GetReq,
            MsgBody::GetNak { .. } => MsgType::GetNak,
            MsgBody::GetDone { .. } => MsgType::GetDone,
            MsgBody::Close => MsgType::Close,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub src_nid: Nid,
    pub incarnation: u64,
    pub seq: u32,
    pub body: MsgBody,
}

impl Message {
    pub fn new(src_nid: Nid, body: MsgBody) -> Self {
        Self {
            src_nid,
            incarnation: 0,
            seq: 0,
            body,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    /// Encode in canonical (little-endian) byte order
    pub fn encode(&self) -> Vec<u8> {
        self.encode_as::<LittleEndian>()
    }

    /// Encode in an explicit byte order, as a peer of the other
    /// endianness would
    pub fn encode_as<B: ByteOrder>(&self) -> Vec<u8> {
        let mut enc = Encoder::<B>::new();
        enc.u32(MSG_MAGIC);
        enc.u16(MSG_VERSION);
        enc.u16(self.msg_type() as u16);
        enc.u64(self.src_nid);
        enc.u64(self.incarnation);
        enc.u32(self.seq);

        match &self.body {
            MsgBody::Noop | MsgBody::Close => {}
            MsgBody::Immediate { hdr, payload } => {
                enc.upper_hdr(hdr);
                enc.u32(payload.len() as u32);
                enc.bytes(payload);
            }
            MsgBody::PutReq { hdr, cookie } => {
                enc.upper_hdr(hdr);
                enc.u64(*cookie);
            }
            MsgBody::PutAck {
                src_cookie,
                dst_cookie,
                desc,
            } => {
                enc.u64(*src_cookie);
                enc.u64(*dst_cookie);
                enc.desc(desc);
            }
            MsgBody::GetReq { hdr, cookie, desc } => {
                enc.upper_hdr(hdr);
                enc.u64(*cookie);
                enc.desc(desc);
            }
            MsgBody::PutNak { cookie }
            | MsgBody::PutDone { cookie }
            | MsgBody::GetNak { cookie }
            | MsgBody::GetDone { cookie } => enc.u64(*cookie),
        }

        enc.finish()
    }

    /// Decode a message, swapping byte order if the magic says so.
    ///
    /// Magic, version and type are checked here; source, incarnation
    /// and sequence need connection state, see [`Message::check`].
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Truncated {
                need: 4,
                have: buf.len(),
            });
        }

        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic == MSG_MAGIC {
            Self::decode_as::<LittleEndian>(buf)
        } else if magic.swap_bytes() == MSG_MAGIC {
            Self::decode_as::<BigEndian>(buf)
        } else {
            Err(WireError::BadMagic(magic))
        }
    }

    fn decode_as<B: ByteOrder>(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::<B>::new(buf);
        let _magic = dec.u32()?;

        let version = dec.u16()?;
        if version != MSG_VERSION {
            return Err(WireError::BadVersion(version));
        }

        let msg_type = MsgType::try_from(dec.u16()?)?;
        let src_nid = dec.u64()?;
        let incarnation = dec.u64()?;
        let seq = dec.u32()?;

        let body = match msg_type {
            MsgType::Noop => MsgBody::Noop,
            MsgType::Close => MsgBody::Close,
            MsgType::Immediate => {
                let hdr = dec.upper_hdr()?;
                let len = dec.u32()? as usize;
                let payload = dec.bytes(len)?.to_vec();
                MsgBody::Immediate { hdr, payload }
            }
            MsgType::PutReq => {
                let hdr = dec.upper_hdr()?;
                let cookie = dec.u64()?;
                MsgBody::PutReq { hdr, cookie }
            }
            MsgType::PutAck => {
                let src_cookie = dec.u64()?;
                let dst_cookie = dec.u64()?;
                let desc = dec.desc()?;
                MsgBody::PutAck {
                    src_cookie,
                    dst_cookie,
                    desc,
                }
            }
            MsgType::GetReq => {
                let hdr = dec.upper_hdr()?;
                let cookie = dec.u64()?;
                let desc = dec.desc()?;
                MsgBody::GetReq { hdr, cookie, desc }
            }
            MsgType::PutNak => MsgBody::PutNak { cookie: dec.u64()? },
            MsgType::PutDone => MsgBody::PutDone { cookie: dec.u64()? },
            MsgType::GetNak => MsgBody::GetNak { cookie: dec.u64()? },
            MsgType::GetDone => MsgBody::GetDone { cookie: dec.u64()? },
        };

        dec.finish()?;

        Ok(Self {
            src_nid,
            incarnation,
            seq,
            body,
        })
    }

    /// Validate the header against the receiving connection
    pub fn check(&self, peer_nid: Nid, incarnation: u64, seq: u32) -> Result<(), WireError> {
        if self.src_nid != peer_nid {
            return Err(WireError::WrongSource {
                expected: peer_nid,
                got: self.src_nid,
            });
        }
        if self.incarnation != incarnation {
            return Err(WireError::WrongIncarnation {
                expected: incarnation,
                got: self.incarnation,
            });
        }
        if self.seq != seq {
            return Err(WireError::WrongSequence {
                expected: seq,
                got: self.seq,
            });
        }
        Ok(())
    }
}

struct Encoder<B> {
    buf: Vec<u8>,
    _order: PhantomData<B>,
}

impl<B: ByteOrder> Encoder<B> {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(HEADER_SIZE + 64),
            _order: PhantomData,
        }
    }

    fn u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        B::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    fn u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        B::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    fn u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        B::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn upper_hdr(&mut self, hdr: &[u8]) {
        debug_assert!(hdr.len() <= MAX_UPPER_HDR);
        self.u16(hdr.len() as u16);
        self.bytes(hdr);
    }

    fn desc(&mut self, d: &RdmaDesc) {
        self.u64(d.key.key);
        self.u16(d.key.cookie);
        self.u16(d.key.md_handle);
        self.u32(d.key.flags);
        self.u64(d.addr);
        self.u32(d.nob);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Decoder<'a, B> {
    buf: &'a [u8],
    off: usize,
    _order: PhantomData<B>,
}

impl<'a, B: ByteOrder> Decoder<'a, B> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            off: 0,
            _order: PhantomData,
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let have = self.buf.len() - self.off;
        if have < n {
            return Err(WireError::Truncated { need: n, have });
        }
        let slice = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(B::read_u16(self.bytes(2)?))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(B::read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(B::read_u64(self.bytes(8)?))
    }

    fn upper_hdr(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        if len > MAX_UPPER_HDR {
            return Err(WireError::HeaderTooLong(len));
        }
        Ok(self.bytes(len)?.to_vec())
    }

    fn desc(&mut self) -> Result<RdmaDesc, WireError> {
        let key = MemKey {
            key: self.u64()?,
            cookie: self.u16()?,
            md_handle: self.u16()?,
            flags: self.u32()?,
        };
        Ok(RdmaDesc {
            key,
            addr: self.u64()?,
            nob: self.u32()?,
        })
    }

    fn finish(self) -> Result<(), WireError> {
        match self.buf.len() - self.off {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes(extra)),
        }
    }
}
