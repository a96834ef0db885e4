//! The device seam between the request pipeline and the hardware layer.

use std::rc::Rc;

use vblkd_errand::Scheduler;

use crate::{Datablock, DmaDirection, DmaSpace, Result};

/// Completion callback for an asynchronous transfer.
///
/// Receives the number of bytes the hardware reports transferred, or the
/// error the request failed or aborted with.
pub type InoutCallback = Box<dyn FnOnce(Result<u32>)>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Logical block addressing supported.
    pub lba: bool,
    /// DMA transfers supported.
    pub dma: bool,
    /// Extended 48-bit addressing enabled.
    pub longaddr: bool,
    /// Bus supports 64-bit addressing.
    pub s64a: bool,
    /// Device is read-only.
    pub ro: bool,
}

/// Hardware configuration relevant to request validation and client setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Hardware ID: the serial number for whole disks, the GUID for
    /// partition views.
    pub hid: String,
    pub serial: String,
    pub model: String,
    pub firmware_rev: String,
    pub ata_major_rev: u16,
    pub ata_minor_rev: u16,
    /// Size of a logical sector in bytes, at least 512.
    pub sector_size: u32,
    pub num_sectors: u64,
    pub features: DeviceFeatures,
}

impl DeviceInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.num_sectors * u64::from(self.sector_size)
    }
}

/// A device that can serve block transfers: a whole ATA disk or a partition
/// view of one.
///
/// Contract for [`BlockDevice::inout_data`]: on `Ok(())` the callback is
/// invoked exactly once when the transfer completes or aborts; on `Err` it is
/// never invoked. `Err(Busy)` means admission failed and the request may be
/// retried unchanged.
pub trait BlockDevice {
    fn info(&self) -> DeviceInfo;

    fn is_read_only(&self) -> bool {
        self.info().features.ro
    }

    fn capacity_bytes(&self) -> u64 {
        self.info().capacity_bytes()
    }

    fn sector_size(&self) -> u32 {
        self.info().sector_size
    }

    /// Maximum bytes of any single scatter block.
    fn max_block_size(&self) -> u32;

    /// Maximum number of scatter blocks per request.
    fn max_segments(&self) -> u32;

    /// Maximum number of requests in flight at once.
    fn max_in_flight(&self) -> u32;

    fn dma_space(&self) -> Rc<dyn DmaSpace>;

    fn inout_data(
        &self,
        sector: u64,
        blocks: &[Datablock],
        dir: DmaDirection,
        cb: InoutCallback,
    ) -> Result<()>;

    /// Reset the underlying hardware, if applicable.
    fn reset_device(&self);

    /// Query the hardware for identity and geometry. `cb` runs when the scan
    /// is finished, whether or not it succeeded.
    fn start_device_scan(self: Rc<Self>, _sched: &Scheduler, cb: Box<dyn FnOnce()>) {
        cb();
    }
}
