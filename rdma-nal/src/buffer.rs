//! Payload memory and transmit buffer setup
//!
//! The RPC layer describes payloads either as virtual fragments ([`Iov`])
//! or page fragments ([`Kiov`]). A descriptor's buffer is derived from
//! that description and, when bulk data must move by RDMA, registered
//! with the fabric before its descriptor is advertised to the peer.

use crate::error::{NalError, Result};
use crate::fabric::{DeviceId, Fabric, FabricError, MemRegion};
use crate::wire::{MemKey, RdmaDesc};
use crate::PAGE_SIZE;
use log::{error, warn};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Shared, fixed-size block of memory
///
/// Cloning shares the storage. The backing allocation never moves, so
/// [`Segment::addr`] is stable for the segment's lifetime.
#[derive(Clone)]
pub struct Segment(Arc<RwLock<Box<[u8]>>>);

impl Segment {
    pub fn new(len: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0u8; len].into_boxed_slice())))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(data.into_boxed_slice())))
    }

    /// One zeroed page
    pub fn page() -> Self {
        Self::new(PAGE_SIZE)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addr(&self) -> u64 {
        self.0.read().as_ptr() as u64
    }

    pub fn read(&self, offset: usize, len: usize) -> std::result::Result<Vec<u8>, FabricError> {
        let data = self.0.read();
        match offset.checked_add(len) {
            Some(end) if end <= data.len() => Ok(data[offset..end].to_vec()),
            _ => Err(FabricError::OutOfBounds {
                offset: offset as u64,
                len,
                size: data.len(),
            }),
        }
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> std::result::Result<(), FabricError> {
        let mut data = self.0.write();
        let size = data.len();
        match offset.checked_add(src.len()) {
            Some(end) if end <= size => {
                data[offset..end].copy_from_slice(src);
                Ok(())
            }
            _ => Err(FabricError::OutOfBounds {
                offset: offset as u64,
                len: src.len(),
                size,
            }),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.read().to_vec()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({:#x}, {})", self.addr(), self.len())
    }
}

/// Virtually addressed fragment
#[derive(Debug, Clone)]
pub struct Iov {
    pub seg: Segment,
    pub offset: usize,
    pub len: usize,
}

impl Iov {
    /// The whole segment as one fragment
    pub fn whole(seg: Segment) -> Self {
        let len = seg.len();
        Self { seg, offset: 0, len }
    }
}

/// Fragment of one page
#[derive(Debug, Clone)]
pub struct Kiov {
    pub page: Segment,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Iov(Vec<Iov>),
    Pages(Vec<Kiov>),
}

impl Payload {
    pub fn total_len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Iov(iov) => iov.iter().map(|f| f.len).sum(),
            Payload::Pages(kiov) => kiov.iter().map(|f| f.len).sum(),
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, Payload::Pages(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    None,
    Immediate,
    VirtUnmapped,
    VirtMapped,
    PhysUnmapped,
    PhysMapped,
}

/// Memory backing one transmit descriptor
#[derive(Debug, Default)]
pub(crate) enum Buffer {
    #[default]
    None,
    /// Copied into the message itself
    Immediate {
        seg: Segment,
        offset: usize,
        nob: usize,
    },
    Virt {
        seg: Segment,
        offset: usize,
        nob: usize,
        mapped: Option<(DeviceId, MemKey)>,
    },
    /// `offset` is the byte offset of the data within the first page
    Phys {
        pages: Vec<Segment>,
        offset: usize,
        nob: usize,
        mapped: Option<(DeviceId, MemKey)>,
    },
}

/// Skip whole fragments covered by `offset`; returns the index of the
/// fragment holding the first byte and the offset within it
fn skip_fragments(lens: impl Iterator<Item = usize>, mut offset: usize) -> Option<(usize, usize)> {
    for (i, len) in lens.enumerate() {
        if offset < len {
            return Some((i, offset));
        }
        offset -= len;
    }
    None
}

/// Locate a single contiguous virtual fragment covering `nob` bytes
fn single_fragment(iov: &[Iov], offset: usize, nob: usize) -> Result<(Segment, usize)> {
    let (idx, off) = skip_fragments(iov.iter().map(|f| f.len), offset)
        .ok_or_else(|| NalError::Fragmented(format!("offset {} beyond payload", offset)))?;
    let frag = &iov[idx];
    if nob > frag.len - off {
        return Err(NalError::Fragmented(
            "can't handle multiple vaddr fragments".to_string(),
        ));
    }
    Ok((frag.seg.clone(), frag.offset + off))
}

impl Buffer {
    /// Buffer whose bytes travel inside the message
    pub fn immediate(iov: &[Iov], offset: usize, nob: usize) -> Result<Self> {
        if nob == 0 {
            return Ok(Buffer::None);
        }
        let (seg, offset) = single_fragment(iov, offset, nob)?;
        Ok(Buffer::Immediate { seg, offset, nob })
    }

    pub fn virt(iov: &[Iov], offset: usize, nob: usize) -> Result<Self> {
        if nob == 0 {
            return Ok(Buffer::None);
        }
        let (seg, offset) = single_fragment(iov, offset, nob)?;
        Ok(Buffer::Virt {
            seg,
            offset,
            nob,
            mapped: None,
        })
    }

    /// Page list that must present one gap-free region to the fabric
    pub fn phys(kiov: &[Kiov], offset: usize, nob: usize, max_regions: usize) -> Result<Self> {
        if nob == 0 {
            return Ok(Buffer::None);
        }
        let (mut idx, off) = skip_fragments(kiov.iter().map(|f| f.len), offset)
            .ok_or_else(|| NalError::Fragmented(format!("offset {} beyond payload", offset)))?;

        let first = &kiov[idx];
        let phys_offset = first.offset + off;
        let mut pages = vec![first.page.clone()];
        let mut resid = nob.saturating_sub(first.len - off);
        if resid > 0 && first.offset + first.len != PAGE_SIZE {
            return Err(NalError::Fragmented(format!(
                "gap in page list after first fragment: offset {}, len {}",
                first.offset, first.len
            )));
        }

        while resid > 0 {
            idx += 1;
            let Some(frag) = kiov.get(idx) else {
                return Err(NalError::Fragmented(format!(
                    "payload {} bytes short of {}",
                    resid, nob
                )));
            };

            // Every page after the first starts at offset 0 and covers
            // what is left of the page or the transfer
            if frag.offset != 0 || frag.len < resid.min(PAGE_SIZE) {
                return Err(NalError::Fragmented(format!(
                    "gap in page list at fragment {}: offset {}, len {}",
                    idx, frag.offset, frag.len
                )));
            }

            if pages.len() == max_regions {
                return Err(NalError::MessageTooLarge {
                    size: nob,
                    max: max_regions * PAGE_SIZE,
                });
            }

            pages.push(frag.page.clone());
            resid = resid.saturating_sub(PAGE_SIZE);
        }

        Ok(Buffer::Phys {
            pages,
            offset: phys_offset,
            nob,
            mapped: None,
        })
    }

    /// Bulk buffer for a payload of either kind
    pub fn setup(payload: &Payload, offset: usize, nob: usize, max_regions: usize) -> Result<Self> {
        match payload {
            Payload::None if nob == 0 => Ok(Buffer::None),
            Payload::None => Err(NalError::Fragmented(format!(
                "{} bytes requested from an empty payload",
                nob
            ))),
            Payload::Iov(iov) => Self::virt(iov, offset, nob),
            Payload::Pages(kiov) => Self::phys(kiov, offset, nob, max_regions),
        }
    }

    pub fn buf_type(&self) -> BufType {
        match self {
            Buffer::None => BufType::None,
            Buffer::Immediate { .. } => BufType::Immediate,
            Buffer::Virt { mapped: None, .. } => BufType::VirtUnmapped,
            Buffer::Virt { .. } => BufType::VirtMapped,
            Buffer::Phys { mapped: None, .. } => BufType::PhysUnmapped,
            Buffer::Phys { .. } => BufType::PhysMapped,
        }
    }

    pub fn nob(&self) -> usize {
        match self {
            Buffer::None => 0,
            Buffer::Immediate { nob, .. } | Buffer::Virt { nob, .. } | Buffer::Phys { nob, .. } => {
                *nob
            }
        }
    }

    /// Bytes to carry inside an IMMEDIATE message
    pub fn immediate_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Buffer::None => Ok(Vec::new()),
            Buffer::Immediate { seg, offset, nob } => Ok(seg.read(*offset, *nob)?),
            other => Err(NalError::Protocol(format!(
                "{:?} buffer sent as immediate",
                other.buf_type()
            ))),
        }
    }

    /// Register with the fabric; no-op when already mapped or nothing to map
    pub fn map(&mut self, fabric: &dyn Fabric, dev: DeviceId) -> std::result::Result<(), FabricError> {
        match self {
            Buffer::Virt {
                seg,
                offset,
                nob,
                mapped: mapped @ None,
            } => {
                let key = fabric.register(
                    dev,
                    MemRegion::Virt {
                        seg: seg.clone(),
                        offset: *offset,
                        len: *nob,
                    },
                )?;
                *mapped = Some((dev, key));
            }
            Buffer::Phys {
                pages,
                mapped: mapped @ None,
                ..
            } => {
                let key = fabric.register(
                    dev,
                    MemRegion::Phys {
                        pages: pages.clone(),
                    },
                )?;
                *mapped = Some((dev, key));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn unmap(&mut self, fabric: &dyn Fabric) {
        let mapped = match self {
            Buffer::Virt { mapped, .. } | Buffer::Phys { mapped, .. } => mapped.take(),
            _ => None,
        };
        if let Some((dev, key)) = mapped {
            if let Err(e) = fabric.deregister(dev, key) {
                error!("Failed to deregister key {:#x} on device {}: {}", key.key, dev, e);
            }
        }
    }

    /// Descriptor advertised to the peer; `None` unless mapped
    pub fn desc(&self) -> Option<RdmaDesc> {
        match self {
            Buffer::Virt {
                seg,
                offset,
                nob,
                mapped: Some((_, key)),
            } => Some(RdmaDesc {
                key: *key,
                addr: seg.addr() + *offset as u64,
                nob: *nob as u32,
            }),
            Buffer::Phys {
                offset,
                nob,
                mapped: Some((_, key)),
                ..
            } => Some(RdmaDesc {
                key: *key,
                addr: *offset as u64,
                nob: *nob as u32,
            }),
            _ => None,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Buffer::Virt { mapped: Some((_, key)), .. } | Buffer::Phys { mapped: Some((_, key)), .. } =
            self
        {
            warn!("Dropping buffer still registered under key {:#x}", key.key);
        }
    }
}
