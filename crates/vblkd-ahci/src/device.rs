//! The ATA device layer: IDENTIFY decoding, command selection, request
//! validation.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, trace, warn};
use vblkd_block::{
    BlockDevice, Datablock, DeviceError, DeviceInfo, DmaDirection, DmaRegion, DmaSpace,
    InoutCallback, Result,
};
use vblkd_errand::Scheduler;

use crate::fis::{Taskfile, CHF_WRITE, MAX_PRDS};
use crate::port::{DeviceType, Port};

/// ATA command opcodes used by this driver.
pub mod ata_cmd {
    pub const ID_DEVICE: u8 = 0xEC;
    pub const READ_DMA: u8 = 0xC8;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const READ_SECTOR: u8 = 0x20;
    pub const READ_SECTOR_EXT: u8 = 0x24;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const WRITE_SECTOR: u8 = 0x30;
    pub const WRITE_SECTOR_EXT: u8 = 0x34;
}

// Word offsets in the IDENTIFY DEVICE data.
const ID_SERIAL_OFS: usize = 10;
const ID_SERIAL_LEN: usize = 20;
const ID_FIRMWARE_OFS: usize = 23;
const ID_FIRMWARE_LEN: usize = 8;
const ID_MODEL_OFS: usize = 27;
const ID_MODEL_LEN: usize = 40;
const ID_CAPABILITIES: usize = 49;
const ID_SECTORS_28: usize = 60;
const ID_ATA_MAJOR_REV: usize = 80;
const ID_ATA_MINOR_REV: usize = 81;
const ID_ENABLED_FEATURES: usize = 85;
const ID_SECTORS_48: usize = 100;
const ID_LOGSECTOR_SIZE: usize = 117;

fn id_word(page: &[u8; 512], word: usize) -> u16 {
    u16::from_le_bytes([page[word * 2], page[word * 2 + 1]])
}

/// ATA ID strings store two ASCII characters per word, high byte first.
fn id_string(page: &[u8; 512], word_ofs: usize, len: usize) -> String {
    let mut s = String::with_capacity(len);
    for i in 0..len / 2 {
        let w = id_word(page, word_ofs + i);
        s.push((w >> 8) as u8 as char);
        s.push((w & 0xFF) as u8 as char);
    }
    s.trim_end().to_string()
}

/// Decode an IDENTIFY DEVICE page into the driver's device model.
pub fn decode_identify(page: &[u8; 512], bus_width: u8) -> DeviceInfo {
    let mut info = DeviceInfo {
        serial: id_string(page, ID_SERIAL_OFS, ID_SERIAL_LEN),
        model: id_string(page, ID_MODEL_OFS, ID_MODEL_LEN),
        firmware_rev: id_string(page, ID_FIRMWARE_OFS, ID_FIRMWARE_LEN),
        ata_major_rev: id_word(page, ID_ATA_MAJOR_REV),
        ata_minor_rev: id_word(page, ID_ATA_MINOR_REV),
        ..Default::default()
    };
    // Unreported major revision reads as all-ones.
    if info.ata_major_rev == 0xFFFF {
        info.ata_major_rev = 0;
    }

    // The HID is the serial number with padding stripped.
    info.hid = info.serial.clone();

    let caps = id_word(page, ID_CAPABILITIES);
    info.features.lba = caps & (1 << 9) != 0;
    info.features.dma = caps & (1 << 8) != 0;
    info.features.longaddr = id_word(page, ID_ENABLED_FEATURES + 1) & (1 << 10) != 0;
    info.features.s64a = bus_width == 64;
    info.features.ro = false;

    // Words 117/118 count 16-bit words per logical sector.
    let logsector = u32::from(id_word(page, ID_LOGSECTOR_SIZE))
        | u32::from(id_word(page, ID_LOGSECTOR_SIZE + 1)) << 16;
    info.sector_size = (2 * logsector).max(512);

    info.num_sectors = if info.features.longaddr {
        u64::from(id_word(page, ID_SECTORS_48))
            | u64::from(id_word(page, ID_SECTORS_48 + 1)) << 16
            | u64::from(id_word(page, ID_SECTORS_48 + 2)) << 32
            | u64::from(id_word(page, ID_SECTORS_48 + 3)) << 48
    } else {
        u64::from(id_word(page, ID_SECTORS_28)) | u64::from(id_word(page, ID_SECTORS_28 + 1)) << 16
    };

    info
}

/// An ATA disk on an AHCI port.
pub struct AhciDevice {
    port: Port,
    info: RefCell<DeviceInfo>,
}

impl AhciDevice {
    /// Create a device for the port, if it carries a device type this
    /// driver can serve.
    pub fn create(port: &Port) -> Option<Rc<Self>> {
        match port.device_type() {
            DeviceType::Ata => Some(Rc::new(Self {
                port: port.clone(),
                info: RefCell::new(DeviceInfo {
                    sector_size: 512,
                    ..Default::default()
                }),
            })),
            other => {
                if other != DeviceType::None {
                    info!(port = port.index(), ?other, "skipping unsupported device type");
                }
                None
            }
        }
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    fn select_command(&self, write: bool) -> u8 {
        let info = self.info.borrow();
        match (write, info.features.dma, info.features.longaddr) {
            (false, true, false) => ata_cmd::READ_DMA,
            (false, true, true) => ata_cmd::READ_DMA_EXT,
            (false, false, false) => ata_cmd::READ_SECTOR,
            (false, false, true) => ata_cmd::READ_SECTOR_EXT,
            (true, true, false) => ata_cmd::WRITE_DMA,
            (true, true, true) => ata_cmd::WRITE_DMA_EXT,
            (true, false, false) => ata_cmd::WRITE_SECTOR,
            (true, false, true) => ata_cmd::WRITE_SECTOR_EXT,
        }
    }
}

impl BlockDevice for AhciDevice {
    fn info(&self) -> DeviceInfo {
        self.info.borrow().clone()
    }

    fn max_block_size(&self) -> u32 {
        0x40_0000
    }

    fn max_segments(&self) -> u32 {
        MAX_PRDS as u32
    }

    fn max_in_flight(&self) -> u32 {
        self.port.max_slots() as u32
    }

    fn dma_space(&self) -> Rc<dyn DmaSpace> {
        self.port.dma_space()
    }

    fn inout_data(
        &self,
        sector: u64,
        blocks: &[Datablock],
        dir: DmaDirection,
        cb: InoutCallback,
    ) -> Result<()> {
        let (sector_size, longaddr, s64a) = {
            let info = self.info.borrow();
            (
                u64::from(info.sector_size),
                info.features.longaddr,
                info.features.s64a,
            )
        };

        let mut total = 0u64;
        for b in blocks {
            if b.len == 0 || u64::from(b.len) % sector_size != 0 {
                return Err(DeviceError::InvalidArgument(
                    "block is not a multiple of the sector size",
                ));
            }
            total += u64::from(b.len);
        }
        let numsec = total / sector_size;

        // A device without 64-bit bus addressing cannot be given high LBAs
        // from a 64-bit host.
        if cfg!(target_pointer_width = "64") && !s64a && sector >= 1 << 32 {
            return Err(DeviceError::InvalidArgument(
                "64-bit address on a 32-bit device",
            ));
        }

        let count = if longaddr {
            if numsec == 0 || numsec > 65536 || sector >= 1 << 48 {
                return Err(DeviceError::InvalidArgument("sector number out of range"));
            }
            // A count of zero encodes the 65536-sector maximum.
            (numsec & 0xFFFF) as u16
        } else {
            if numsec == 0 || numsec > 256 || sector >= 1 << 28 {
                return Err(DeviceError::InvalidArgument("sector number out of range"));
            }
            (numsec & 0xFF) as u16
        };

        let write = dir == DmaDirection::ToDevice;
        let command = self.select_command(write);
        let flags = if write { CHF_WRITE } else { 0 };
        let task = Taskfile::rw(command, sector, count, flags, blocks);

        let slot = self.port.send_command(&task, cb)?;
        trace!(sector, slot, "io to disk submitted");
        Ok(())
    }

    fn reset_device(&self) {
        self.port.reset(Box::new(|| {}));
    }

    /// IDENTIFY the device: one 512-byte from-device DMA transfer, retried
    /// while the slot pool is saturated.
    fn start_device_scan(self: Rc<Self>, sched: &Scheduler, cb: Box<dyn FnOnce()>) {
        let dma = self.port.dma_space();
        let infopage = match DmaRegion::alloc(&dma, 512, DmaDirection::FromDevice) {
            Ok(region) => Rc::new(region),
            Err(err) => {
                warn!(%err, "cannot allocate identify buffer");
                cb();
                return;
            }
        };
        trace!(port = self.port.index(), "reading device info");

        let done: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Some(cb)));
        let attempt_done = done.clone();
        let dev = self.clone();

        sched.poll(
            10,
            10_000,
            move || {
                let completion = attempt_done.clone();
                let page_region = infopage.clone();
                let cb_dev = dev.clone();
                let cb: InoutCallback = Box::new(move |res| {
                    match res {
                        Ok(_) => {
                            let mut page = [0u8; 512];
                            if page_region.read(0, &mut page).is_ok() {
                                let decoded = decode_identify(&page, cb_dev.port.bus_width());
                                info!(
                                    port = cb_dev.port.index(),
                                    serial = %decoded.serial,
                                    model = %decoded.model,
                                    lba = decoded.features.lba,
                                    dma = decoded.features.dma,
                                    sectors = decoded.num_sectors,
                                    sector_size = decoded.sector_size,
                                    "identified device"
                                );
                                *cb_dev.info.borrow_mut() = decoded;
                            }
                        }
                        Err(err) => warn!(%err, "identify transfer failed"),
                    }
                    if let Some(done) = completion.borrow_mut().take() {
                        done();
                    }
                });

                let block = Datablock::new(infopage.bus_addr(), 512);
                let task = Taskfile {
                    command: ata_cmd::ID_DEVICE,
                    features: 0,
                    lba: 0,
                    device: 0,
                    count: 0,
                    icc: 0,
                    control: 0,
                    flags: 0,
                    blocks: &[block],
                };
                match dev.port.send_command(&task, cb) {
                    Ok(_) => true,
                    Err(DeviceError::Busy) => false,
                    Err(err) => {
                        warn!(%err, "cannot issue identify");
                        if let Some(done) = attempt_done.borrow_mut().take() {
                            done();
                        }
                        true
                    }
                }
            },
            move |ok| {
                if !ok {
                    if let Some(done) = done.borrow_mut().take() {
                        done();
                    }
                }
            },
        );
    }
}
