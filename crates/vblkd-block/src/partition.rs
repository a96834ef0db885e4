//! Partition views over a parent disk.

use std::cell::Cell;
use std::rc::Rc;

use crate::{
    Datablock, DeviceError, DeviceInfo, DmaDirection, DmaSpace, BlockDevice, InoutCallback, Result,
};

/// Information about a single partition as decoded from the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Textual GUID, 8-4-4-2·2-6·2 uppercase hex.
    pub guid: String,
    /// First valid sector.
    pub first: u64,
    /// Last valid sector.
    pub last: u64,
    /// Attribute flags from the partition entry.
    pub flags: u64,
}

/// A partition exposed as its own block device.
///
/// Requests are rebased onto the parent disk and bounded against the
/// partition's extent. The view enforces its own in-flight cap so that one
/// partition cannot monopolize the parent's slot pool; when the cap is
/// reached, admission fails with `Busy`.
pub struct PartitionedDevice {
    parent: Rc<dyn BlockDevice>,
    info: DeviceInfo,
    start: u64,
    size: u64,
    in_flight: Rc<Cell<u32>>,
    max_in_flight: Cell<u32>,
}

impl PartitionedDevice {
    pub fn new(parent: Rc<dyn BlockDevice>, pi: &PartitionInfo) -> Result<Rc<Self>> {
        if pi.last < pi.first {
            return Err(DeviceError::InvalidArgument(
                "last sector of partition before first sector",
            ));
        }

        let size = pi.last - pi.first + 1;
        let mut info = parent.info();
        info.num_sectors = size;
        info.hid = pi.guid.clone();

        let max = parent.max_in_flight();
        Ok(Rc::new(Self {
            parent,
            info,
            start: pi.first,
            size,
            in_flight: Rc::new(Cell::new(0)),
            max_in_flight: Cell::new(max),
        }))
    }

    /// Set the number of requests that may be in flight in parallel.
    ///
    /// A positive value is taken as an absolute count (clamped to the
    /// parent's); zero or a negative value means "all of the parent's slots
    /// but that many", clamped to at least one.
    pub fn set_max_in_flight(&self, mx: i32) {
        let parent_max = self.parent.max_in_flight();
        let val = if mx > 0 {
            (mx as u32).min(parent_max)
        } else {
            (i64::from(parent_max) + i64::from(mx)).max(1) as u32
        };
        self.max_in_flight.set(val);
    }

    fn admit(&self) -> Result<()> {
        if self.in_flight.get() >= self.max_in_flight.get() {
            return Err(DeviceError::Busy);
        }
        self.in_flight.set(self.in_flight.get() + 1);
        Ok(())
    }

    /// Wrap a completion so the in-flight count drops when it fires.
    fn releasing(&self, cb: InoutCallback) -> InoutCallback {
        let in_flight = self.in_flight.clone();
        Box::new(move |res| {
            in_flight.set(in_flight.get() - 1);
            cb(res);
        })
    }

    fn release(&self) {
        self.in_flight.set(self.in_flight.get() - 1);
    }
}

impl BlockDevice for PartitionedDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn max_block_size(&self) -> u32 {
        self.parent.max_block_size()
    }

    fn max_segments(&self) -> u32 {
        self.parent.max_segments()
    }

    fn max_in_flight(&self) -> u32 {
        self.max_in_flight.get()
    }

    fn dma_space(&self) -> Rc<dyn DmaSpace> {
        self.parent.dma_space()
    }

    fn inout_data(
        &self,
        sector: u64,
        blocks: &[Datablock],
        dir: DmaDirection,
        cb: InoutCallback,
    ) -> Result<()> {
        if sector >= self.size {
            return Err(DeviceError::InvalidArgument("sector outside partition"));
        }
        let total: u64 = blocks.iter().map(|b| u64::from(b.len)).sum();
        if (total + 511) / 512 > self.size - sector {
            return Err(DeviceError::InvalidArgument(
                "transfer extends past end of partition",
            ));
        }

        self.admit()?;
        let cb = self.releasing(cb);
        self.parent
            .inout_data(sector + self.start, blocks, dir, cb)
            .inspect_err(|_| self.release())
    }

    fn reset_device(&self) {
        // Resetting the parent port would kill transfers on sibling
        // partitions, so a partition-level reset does nothing.
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::bus::{MemBus, MemDevice};
    use crate::DmaRegion;

    fn disk(sectors: u64) -> (Rc<MemBus>, Rc<MemDevice>) {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus.clone(), sectors, 512);
        (bus, dev)
    }

    fn part(dev: Rc<MemDevice>, first: u64, last: u64) -> Rc<PartitionedDevice> {
        let pi = PartitionInfo {
            guid: "01234567-89AB-CDEF-0123-456789ABCDEF".into(),
            first,
            last,
            flags: 0,
        };
        PartitionedDevice::new(dev, &pi).unwrap()
    }

    #[test]
    fn requests_are_rebased_by_the_partition_start() {
        let (bus, dev) = disk(1024);
        dev.fill_sector(100, 0xAB);
        let p = part(dev, 100, 199);

        let dma: Rc<dyn crate::DmaSpace> = bus.clone();
        let region = DmaRegion::alloc(&dma, 512, DmaDirection::FromDevice).unwrap();
        let block = Datablock::new(region.bus_addr(), 512);

        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        p.inout_data(
            0,
            &[block],
            DmaDirection::FromDevice,
            Box::new(move |res| {
                assert_eq!(res, Ok(512));
                d.set(true);
            }),
        )
        .unwrap();

        assert!(done.get());
        let mut buf = [0u8; 512];
        region.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn out_of_range_sector_is_rejected() {
        let (_bus, dev) = disk(1024);
        let p = part(dev, 100, 199);
        let err = p
            .inout_data(
                100,
                &[Datablock::new(0, 512)],
                DmaDirection::FromDevice,
                Box::new(|_| panic!("callback must not fire")),
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn transfer_crossing_partition_end_is_rejected() {
        let (_bus, dev) = disk(1024);
        let p = part(dev, 100, 199);
        // Starts on the last sector but covers two.
        let err = p
            .inout_data(
                99,
                &[Datablock::new(0, 1024)],
                DmaDirection::FromDevice,
                Box::new(|_| panic!("callback must not fire")),
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn in_flight_cap_returns_busy_and_recovers() {
        let (bus, dev) = disk(1024);
        dev.set_deferred(true);
        let p = part(dev.clone(), 0, 1023);
        p.set_max_in_flight(2);

        let dma: Rc<dyn crate::DmaSpace> = bus.clone();
        let region = DmaRegion::alloc(&dma, 512, DmaDirection::FromDevice).unwrap();
        let block = Datablock::new(region.bus_addr(), 512);

        let submit = |p: &PartitionedDevice| {
            p.inout_data(0, &[block], DmaDirection::FromDevice, Box::new(|_| {}))
        };

        submit(&p).unwrap();
        submit(&p).unwrap();
        assert_eq!(submit(&p).unwrap_err(), DeviceError::Busy);

        dev.complete_one();
        submit(&p).unwrap();
        assert_eq!(submit(&p).unwrap_err(), DeviceError::Busy);
    }

    #[test]
    fn synchronous_parent_error_releases_the_slot() {
        let (bus, dev) = disk(1024);
        dev.fail_next_admissions(1);
        let p = part(dev, 0, 1023);
        p.set_max_in_flight(1);

        let dma: Rc<dyn crate::DmaSpace> = bus.clone();
        let region = DmaRegion::alloc(&dma, 512, DmaDirection::FromDevice).unwrap();
        let block = Datablock::new(region.bus_addr(), 512);

        let err = p
            .inout_data(0, &[block], DmaDirection::FromDevice, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, DeviceError::Io);

        // The failed admission must not consume the in-flight budget.
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        p.inout_data(
            0,
            &[block],
            DmaDirection::FromDevice,
            Box::new(move |_| d.set(true)),
        )
        .unwrap();
        assert!(done.get());
    }

    #[test]
    fn max_in_flight_arithmetic() {
        let (_bus, dev) = disk(64);
        dev.set_max_in_flight(8);
        let p = part(dev, 0, 63);

        assert_eq!(p.max_in_flight(), 8);
        p.set_max_in_flight(4);
        assert_eq!(p.max_in_flight(), 4);
        p.set_max_in_flight(100);
        assert_eq!(p.max_in_flight(), 8);
        p.set_max_in_flight(-2);
        assert_eq!(p.max_in_flight(), 6);
        p.set_max_in_flight(-100);
        assert_eq!(p.max_in_flight(), 1);
        p.set_max_in_flight(0);
        assert_eq!(p.max_in_flight(), 8);
    }

    #[test]
    fn inverted_extent_is_rejected() {
        let (_bus, dev) = disk(64);
        let pi = PartitionInfo {
            guid: "x".into(),
            first: 10,
            last: 9,
            flags: 0,
        };
        assert!(PartitionedDevice::new(dev, &pi).is_err());
    }
}
