//! Device-side split virtqueue handling.
//!
//! The rings live in client memory; every access goes through [`GuestMem`],
//! which the front end backs with the client's registered dataspaces.

use vblkd_block::{DeviceError, Result};

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

const DESC_SIZE: u64 = 16;
const USED_ENTRY_SIZE: u64 = 8;

/// Client memory as seen through the registered dataspace windows.
pub trait GuestMem {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&self, addr: u64, buf: &[u8]) -> Result<()>;
}

pub trait GuestMemExt: GuestMem {
    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn write_u16(&self, addr: u64, val: u16) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }

    fn write_u32(&self, addr: u64, val: u32) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn write_u8(&self, addr: u64, val: u8) -> Result<()> {
        self.write(addr, &[val])
    }
}

impl<T: GuestMem + ?Sized> GuestMemExt for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    fn load(mem: &dyn GuestMem, table: u64, index: u16) -> Result<Self> {
        let mut raw = [0u8; 16];
        mem.read(table + u64::from(index) * DESC_SIZE, &mut raw)?;
        Ok(Self {
            addr: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        })
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// A fully walked descriptor chain.
#[derive(Debug, Clone)]
pub struct DescriptorChain {
    head: u16,
    descs: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn head_index(&self) -> u16 {
        self.head
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descs
    }
}

/// Outcome of pulling one entry off the available ring.
pub enum PoppedChain {
    Chain(DescriptorChain),
    /// The head was consumable but the chain itself is malformed; the caller
    /// still has to push `head` to the used ring to return the buffers.
    Invalid { head: u16 },
}

/// Device-side view of one split virtqueue.
pub struct VirtQueue {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    next_avail: u16,
    used_idx: u16,
}

impl VirtQueue {
    pub fn new(size: u16, desc_addr: u64, avail_addr: u64, used_addr: u64) -> Result<Self> {
        if size == 0 || size > 32768 || !size.is_power_of_two() {
            return Err(DeviceError::InvalidArgument("bad virtqueue size"));
        }
        Ok(Self {
            size,
            desc_addr,
            avail_addr,
            used_addr,
            next_avail: 0,
            used_idx: 0,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Pull the next available descriptor chain, if the driver published one.
    ///
    /// An `Err` means the ring itself is unreadable; `Invalid` means this
    /// one chain is malformed (bad index, loop, or longer than the queue).
    pub fn next_avail(&mut self, mem: &dyn GuestMem) -> Result<Option<PoppedChain>> {
        let avail_idx = mem.read_u16(self.avail_addr + 2)?;
        if self.next_avail == avail_idx {
            return Ok(None);
        }

        let slot = u64::from(self.next_avail % self.size);
        let head = mem.read_u16(self.avail_addr + 4 + slot * 2)?;
        self.next_avail = self.next_avail.wrapping_add(1);

        Ok(Some(self.walk_chain(mem, head)))
    }

    fn walk_chain(&self, mem: &dyn GuestMem, head: u16) -> PoppedChain {
        if head >= self.size {
            return PoppedChain::Invalid { head };
        }

        let mut descs = Vec::new();
        let mut index = head;
        loop {
            let desc = match Descriptor::load(mem, self.desc_addr, index) {
                Ok(d) => d,
                Err(_) => return PoppedChain::Invalid { head },
            };

            if desc.is_indirect() {
                // One level of indirection: the buffer holds a private
                // descriptor table. An indirect descriptor must be the only
                // element referenced from the ring entry.
                if !descs.is_empty() || desc.has_next() || desc.len % 16 != 0 {
                    return PoppedChain::Invalid { head };
                }
                let count = desc.len / 16;
                if count == 0 || count as usize > usize::from(self.size) {
                    return PoppedChain::Invalid { head };
                }
                for i in 0..count as u16 {
                    match Descriptor::load(mem, desc.addr, i) {
                        Ok(d) if d.is_indirect() => return PoppedChain::Invalid { head },
                        Ok(d) => descs.push(d),
                        Err(_) => return PoppedChain::Invalid { head },
                    }
                }
                return PoppedChain::Chain(DescriptorChain { head, descs });
            }

            descs.push(desc);
            // A chain longer than the queue must contain a cycle.
            if descs.len() > usize::from(self.size) {
                return PoppedChain::Invalid { head };
            }
            if !desc.has_next() {
                break;
            }
            index = desc.next;
            if index >= self.size {
                return PoppedChain::Invalid { head };
            }
        }

        PoppedChain::Chain(DescriptorChain { head, descs })
    }

    /// Consume a chain: publish `(head, len)` in the used ring.
    pub fn add_used(&mut self, mem: &dyn GuestMem, head: u16, len: u32) -> Result<()> {
        let slot = u64::from(self.used_idx % self.size);
        let entry = self.used_addr + 4 + slot * USED_ENTRY_SIZE;
        mem.write_u32(entry, u32::from(head))?;
        mem.write_u32(entry + 4, len)?;
        self.used_idx = self.used_idx.wrapping_add(1);
        mem.write_u16(self.used_addr + 2, self.used_idx)
    }
}
