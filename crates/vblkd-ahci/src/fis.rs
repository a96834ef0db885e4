//! On-wire command structures: the host-to-device register FIS, the command
//! list, and the per-slot command tables with their PRD entries.
//!
//! All of it lives in one DMA-coherent region per port:
//!
//! ```text
//! offset 0x000  command list: 32 headers x 32 bytes (CLB, 1 KiB aligned)
//! offset 0x400  FIS receive area, 256 bytes (FB, 256-byte aligned)
//! offset 0x500  command tables, one per slot, 2816 bytes each
//! ```
//!
//! A command table holds the 64-byte command FIS, a reserved area and up to
//! [`MAX_PRDS`] physical region descriptors of 16 bytes each.

use vblkd_block::{Datablock, DeviceError, DmaDirection, DmaRegion, DmaSpace, Result};

use std::rc::Rc;

/// Maximum number of scatter-gather entries per command table.
pub const MAX_PRDS: usize = 168;

pub const FIS_TYPE_H2D: u8 = 0x27;

pub const CMD_HEADER_SIZE: usize = 32;
pub const CMD_LIST_SLOTS: usize = 32;
pub const FIS_RX_OFFSET: usize = 0x400;
pub const FIS_RX_SIZE: usize = 0x100;
pub const CMD_TABLE_OFFSET: usize = FIS_RX_OFFSET + FIS_RX_SIZE;
/// 64-byte CFIS + 64 reserved bytes + PRD entries.
pub const CMD_TABLE_SIZE: usize = 128 + MAX_PRDS * 16;
pub const CMD_TABLE_PRD_OFFSET: usize = 128;

// Command header DW0 bits.
const HDR_CFL_SHIFT: u32 = 0;
const HDR_ATAPI: u32 = 1 << 5;
const HDR_WRITE: u32 = 1 << 6;
const HDR_PREFETCHABLE: u32 = 1 << 7;
const HDR_CLEAR_BUSY: u32 = 1 << 10;
const HDR_PRDTL_SHIFT: u32 = 16;

// Taskfile flags.
pub const CHF_PREFETCHABLE: u32 = 1 << 0;
pub const CHF_WRITE: u32 = 1 << 1;
pub const CHF_ATAPI: u32 = 1 << 2;

/// The ATA register image embedded in a host-to-device FIS, plus the
/// scatter list it transfers.
pub struct Taskfile<'a> {
    pub command: u8,
    pub features: u16,
    /// 48 bits used.
    pub lba: u64,
    pub device: u8,
    pub count: u16,
    pub icc: u8,
    pub control: u8,
    pub flags: u32,
    pub blocks: &'a [Datablock],
}

impl<'a> Taskfile<'a> {
    /// A plain read or write at `lba`. The device register defaults to LBA
    /// mode, ICC and control to zero.
    pub fn rw(command: u8, lba: u64, count: u16, flags: u32, blocks: &'a [Datablock]) -> Self {
        Self {
            command,
            features: 0,
            lba,
            device: 0x40,
            count,
            icc: 0,
            control: 0,
            flags,
            blocks,
        }
    }
}

/// The DMA region backing one port's command list, FIS receive area and
/// command tables, with accessors for the fields the driver reads back.
pub struct CommandMemory {
    region: DmaRegion,
    nslots: usize,
}

impl CommandMemory {
    pub fn new(dma: &Rc<dyn DmaSpace>, nslots: usize) -> Result<Self> {
        if nslots == 0 || nslots > CMD_LIST_SLOTS {
            return Err(DeviceError::InvalidArgument("slot count out of range"));
        }
        let len = CMD_TABLE_OFFSET + nslots * CMD_TABLE_SIZE;
        let region = DmaRegion::alloc(dma, len, DmaDirection::Bidirectional)?;
        Ok(Self { region, nslots })
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    /// Bus address of the command list, for PxCLB/PxCLBU.
    pub fn clb_bus(&self) -> u64 {
        self.region.bus_addr()
    }

    /// Bus address of the FIS receive area, for PxFB/PxFBU.
    pub fn fb_bus(&self) -> u64 {
        self.region.bus_addr() + FIS_RX_OFFSET as u64
    }

    fn header_offset(&self, slot: usize) -> usize {
        slot * CMD_HEADER_SIZE
    }

    fn table_offset(&self, slot: usize) -> usize {
        CMD_TABLE_OFFSET + slot * CMD_TABLE_SIZE
    }

    fn table_bus(&self, slot: usize) -> u64 {
        self.region.bus_addr() + self.table_offset(slot) as u64
    }

    /// Fill the slot's command FIS and header from a taskfile.
    pub fn write_command(&self, slot: usize, task: &Taskfile) -> Result<()> {
        let mut cfis = [0u8; 20];
        cfis[0] = FIS_TYPE_H2D;
        cfis[1] = 1 << 7; // command FIS
        cfis[2] = task.command;
        cfis[3] = task.features as u8;
        cfis[4] = task.lba as u8;
        cfis[5] = (task.lba >> 8) as u8;
        cfis[6] = (task.lba >> 16) as u8;
        cfis[7] = task.device;
        cfis[8] = (task.lba >> 24) as u8;
        cfis[9] = (task.lba >> 32) as u8;
        cfis[10] = (task.lba >> 40) as u8;
        cfis[11] = (task.features >> 8) as u8;
        cfis[12] = task.count as u8;
        cfis[13] = (task.count >> 8) as u8;
        cfis[14] = task.icc;
        cfis[15] = task.control;
        self.region.write(self.table_offset(slot), &cfis)?;

        let mut flags = 5 << HDR_CFL_SHIFT | HDR_CLEAR_BUSY;
        if task.flags & CHF_PREFETCHABLE != 0 {
            flags |= HDR_PREFETCHABLE;
        }
        if task.flags & CHF_WRITE != 0 {
            flags |= HDR_WRITE;
        }
        if task.flags & CHF_ATAPI != 0 {
            flags |= HDR_ATAPI;
        }

        let hdr = self.header_offset(slot);
        self.region.write_u32(hdr, flags)?;
        self.region.write_u32(hdr + 4, 0)?; // PRDBC
        let ctba = self.table_bus(slot);
        self.region.write_u32(hdr + 8, ctba as u32)?;
        self.region.write_u32(hdr + 12, (ctba >> 32) as u32)?;
        Ok(())
    }

    /// Fill the slot's PRD table from a scatter list and record its length
    /// in the command header.
    pub fn write_prds(&self, slot: usize, blocks: &[Datablock]) -> Result<()> {
        if blocks.len() > MAX_PRDS {
            return Err(DeviceError::InvalidArgument("scatter list too long"));
        }
        let base = self.table_offset(slot) + CMD_TABLE_PRD_OFFSET;
        for (i, b) in blocks.iter().enumerate() {
            let off = base + i * 16;
            self.region.write_u32(off, b.bus_addr as u32)?;
            self.region.write_u32(off + 4, (b.bus_addr >> 32) as u32)?;
            self.region.write_u32(off + 8, 0)?;
            // The DBC field stores byte count minus one.
            self.region.write_u32(off + 12, b.len - 1)?;
        }

        let hdr = self.header_offset(slot);
        let flags = self.region.read_u32(hdr)?;
        let flags = (flags & 0xFFFF) | ((blocks.len() as u32) << HDR_PRDTL_SHIFT);
        self.region.write_u32(hdr, flags)
    }

    /// Byte count the hardware reports transferred for the slot.
    pub fn prdbc(&self, slot: usize) -> u32 {
        self.region.read_u32(self.header_offset(slot) + 4).unwrap_or(0)
    }

    /// Make the slot's header and table visible to the device.
    ///
    /// The workspace targets run with coherent DMA, so this is a hook, not a
    /// cache operation. A port to a non-coherent platform implements it.
    pub fn flush(&self, _slot: usize) {}
}
