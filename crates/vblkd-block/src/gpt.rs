//! GUID partition table discovery.
//!
//! Two device reads: LBA 0..1 to find the header (the protective MBR in
//! LBA 0 is ignored), then the partition entry array from wherever the
//! header points. Both reads go through the normal request pipeline and
//! retry on `Busy`, so discovery competes fairly with client I/O.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, trace, warn};
use vblkd_errand::Scheduler;

use crate::{
    Datablock, BlockDevice, DeviceError, DmaDirection, DmaRegion, InoutCallback, PartitionInfo,
    Result,
};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

// Header field offsets, relative to the start of the header sector.
const GPT_PARRAY_LBA: usize = 72;
const GPT_NUM_ENTRIES: usize = 80;
const GPT_ENTRY_SIZE: usize = 84;

// Entry field offsets.
const ENTRY_GUID: usize = 16;
const ENTRY_FIRST: usize = 32;
const ENTRY_LAST: usize = 40;
const ENTRY_FLAGS: usize = 48;
const ENTRY_MIN_SIZE: usize = 56;

/// Upper bound on the entry array we are willing to fetch.
const MAX_ARRAY_BYTES: u64 = 0x100_0000;

/// Read the partition table of `dev` and hand the result to `callback`.
///
/// Every failure mode (unreadable sectors, missing signature, implausible
/// header fields) degrades to an empty partition list; the disk itself is
/// still usable as a whole device.
pub fn read_partition_table(
    dev: Rc<dyn BlockDevice>,
    sched: Scheduler,
    callback: impl FnOnce(Vec<PartitionInfo>) + 'static,
) {
    let secsz = dev.sector_size() as usize;
    let header = match DmaRegion::alloc(&dev.dma_space(), 2 * secsz, DmaDirection::FromDevice) {
        Ok(region) => Rc::new(region),
        Err(err) => {
            warn!(%err, "cannot allocate partition header buffer");
            callback(Vec::new());
            return;
        }
    };

    let block = Datablock::new(header.bus_addr(), (2 * secsz) as u32);
    let dev2 = dev.clone();
    let sched2 = sched.clone();
    read_sectors(dev, &sched, 0, block, move |res| {
        if let Err(err) = res {
            warn!(%err, "cannot read partition header sectors");
            callback(Vec::new());
            return;
        }
        parse_header(dev2, sched2, header, callback);
    });
}

fn parse_header(
    dev: Rc<dyn BlockDevice>,
    sched: Scheduler,
    header: Rc<DmaRegion>,
    callback: impl FnOnce(Vec<PartitionInfo>) + 'static,
) {
    let secsz = dev.sector_size() as usize;

    let mut sig = [0u8; 8];
    if header.read(secsz, &mut sig).is_err() || &sig != GPT_SIGNATURE {
        trace!("no GPT signature, assuming unpartitioned disk");
        callback(Vec::new());
        return;
    }

    let parray_lba = header.dataspace().read_u64(secsz + GPT_PARRAY_LBA).unwrap_or(0);
    let num_entries = header.read_u32(secsz + GPT_NUM_ENTRIES).unwrap_or(0);
    let entry_size = header.read_u32(secsz + GPT_ENTRY_SIZE).unwrap_or(0);

    info!(num_entries, "GUID partition header found");

    let array_bytes = u64::from(num_entries) * u64::from(entry_size);
    if (entry_size as usize) < ENTRY_MIN_SIZE || array_bytes == 0 || array_bytes > MAX_ARRAY_BYTES {
        warn!(num_entries, entry_size, "implausible partition array, ignoring");
        callback(Vec::new());
        return;
    }

    let numsec = array_bytes.div_ceil(secsz as u64);
    let array_len = (numsec * secsz as u64) as usize;
    let parray = match DmaRegion::alloc(&dev.dma_space(), array_len, DmaDirection::FromDevice) {
        Ok(region) => Rc::new(region),
        Err(err) => {
            warn!(%err, "cannot allocate partition array buffer");
            callback(Vec::new());
            return;
        }
    };

    trace!(parray_lba, array_len, "reading GPT entry array");
    let block = Datablock::new(parray.bus_addr(), array_len as u32);
    read_sectors(dev, &sched, parray_lba, block, move |res| {
        if let Err(err) = res {
            warn!(%err, "cannot read partition entry array");
            callback(Vec::new());
            return;
        }
        callback(decode_entries(&parray, num_entries, entry_size));
    });
}

fn decode_entries(parray: &DmaRegion, num_entries: u32, entry_size: u32) -> Vec<PartitionInfo> {
    let mut partitions = Vec::new();
    for i in 0..num_entries as usize {
        let off = i * entry_size as usize;
        let first = match parray.dataspace().read_u64(off + ENTRY_FIRST) {
            Ok(v) => v,
            Err(_) => break,
        };
        let last = parray.dataspace().read_u64(off + ENTRY_LAST).unwrap_or(0);
        if first == 0 || last < first {
            continue;
        }

        let mut guid = [0u8; 16];
        if parray.read(off + ENTRY_GUID, &mut guid).is_err() {
            break;
        }
        let flags = parray.dataspace().read_u64(off + ENTRY_FLAGS).unwrap_or(0);

        let inf = PartitionInfo {
            guid: format_guid(&guid),
            first,
            last,
            flags,
        };
        trace!(guid = %inf.guid, first, last, "found partition");
        partitions.push(inf);
    }
    partitions
}

/// Format the on-disk mixed-endian GUID as 8-4-4-2·2-6·2 uppercase hex.
fn format_guid(raw: &[u8; 16]) -> String {
    let d1 = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(raw[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(raw[6..8].try_into().unwrap());
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        d1, d2, d3, raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15]
    )
}

/// Issue a single read, retrying while the device reports `Busy`.
fn read_sectors(
    dev: Rc<dyn BlockDevice>,
    sched: &Scheduler,
    sector: u64,
    block: Datablock,
    done: impl FnOnce(Result<u32>) + 'static,
) {
    let done: Rc<RefCell<Option<Box<dyn FnOnce(Result<u32>)>>>> =
        Rc::new(RefCell::new(Some(Box::new(done))));

    let attempt_done = done.clone();
    sched.poll(
        10,
        10_000,
        move || {
            let completion = attempt_done.clone();
            let cb: InoutCallback = Box::new(move |res| {
                if let Some(done) = completion.borrow_mut().take() {
                    done(res);
                }
            });
            match dev.inout_data(sector, &[block], DmaDirection::FromDevice, cb) {
                Ok(()) => true,
                Err(DeviceError::Busy) => false,
                Err(err) => {
                    if let Some(done) = attempt_done.borrow_mut().take() {
                        done(Err(err));
                    }
                    true
                }
            }
        },
        move |ok| {
            if !ok {
                if let Some(done) = done.borrow_mut().take() {
                    done(Err(DeviceError::Busy));
                }
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use pretty_assertions::assert_eq;
    use super::*;
    use crate::bus::{MemBus, MemDevice};
    use vblkd_errand::ManualClock;

    const TEST_GUID: [u8; 16] = [
        0x67, 0x45, 0x23, 0x01, 0xAB, 0x89, 0xEF, 0xCD, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD,
        0xEF,
    ];

    fn write_gpt(dev: &MemDevice, entries: &[(u64, u64, u64)]) {
        // Header in LBA 1.
        let mut hdr = vec![0u8; 512];
        hdr[0..8].copy_from_slice(GPT_SIGNATURE);
        hdr[GPT_PARRAY_LBA..GPT_PARRAY_LBA + 8].copy_from_slice(&2u64.to_le_bytes());
        hdr[GPT_NUM_ENTRIES..GPT_NUM_ENTRIES + 4]
            .copy_from_slice(&(entries.len() as u32).to_le_bytes());
        hdr[GPT_ENTRY_SIZE..GPT_ENTRY_SIZE + 4].copy_from_slice(&128u32.to_le_bytes());
        dev.write_sector(1, &hdr);

        // Entry array starting at LBA 2.
        let mut array = vec![0u8; ((entries.len() * 128).div_ceil(512).max(1)) * 512];
        for (i, (first, last, flags)) in entries.iter().enumerate() {
            let off = i * 128;
            array[off + ENTRY_GUID..off + ENTRY_GUID + 16].copy_from_slice(&TEST_GUID);
            array[off + ENTRY_FIRST..off + ENTRY_FIRST + 8].copy_from_slice(&first.to_le_bytes());
            array[off + ENTRY_LAST..off + ENTRY_LAST + 8].copy_from_slice(&last.to_le_bytes());
            array[off + ENTRY_FLAGS..off + ENTRY_FLAGS + 8].copy_from_slice(&flags.to_le_bytes());
        }
        for (i, sector) in array.chunks(512).enumerate() {
            dev.write_sector(2 + i as u64, sector);
        }
    }

    fn run_reader(dev: Rc<MemDevice>) -> Vec<PartitionInfo> {
        let clock = ManualClock::new();
        let sched = Scheduler::new(Rc::new(clock));
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        read_partition_table(dev, sched, move |parts| *r.borrow_mut() = Some(parts));
        let out = result.borrow_mut().take().expect("reader did not finish");
        out
    }

    #[test]
    fn guid_formatting_matches_the_mixed_endian_layout() {
        assert_eq!(format_guid(&TEST_GUID), "01234567-89AB-CDEF-0123-456789ABCDEF");
    }

    #[test]
    fn decodes_valid_entries_and_skips_empty_ones() {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus, 8192, 512);
        write_gpt(&dev, &[(2048, 4095, 0x5), (0, 100, 0), (300, 200, 0), (64, 64, 0)]);

        let parts = run_reader(dev);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].guid, "01234567-89AB-CDEF-0123-456789ABCDEF");
        assert_eq!(parts[0].first, 2048);
        assert_eq!(parts[0].last, 4095);
        assert_eq!(parts[0].flags, 0x5);
        assert_eq!((parts[1].first, parts[1].last), (64, 64));
    }

    #[test]
    fn missing_signature_yields_no_partitions() {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus, 128, 512);
        assert!(run_reader(dev).is_empty());
    }

    #[test]
    fn implausible_entry_size_yields_no_partitions() {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus, 128, 512);
        write_gpt(&dev, &[(10, 20, 0)]);
        let mut hdr = dev.read_sector(1);
        hdr[GPT_ENTRY_SIZE..GPT_ENTRY_SIZE + 4].copy_from_slice(&8u32.to_le_bytes());
        dev.write_sector(1, &hdr);
        assert!(run_reader(dev).is_empty());
    }

    #[test]
    fn busy_device_is_retried_until_the_read_goes_through() {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus, 8192, 512);
        write_gpt(&dev, &[(2048, 4095, 0)]);
        dev.busy_next_admissions(3);

        let clock = ManualClock::new();
        let sched = Scheduler::new(Rc::new(clock.clone()));
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        read_partition_table(dev.clone(), sched.clone(), move |parts| {
            *r.borrow_mut() = Some(parts)
        });

        assert!(result.borrow().is_none());
        while result.borrow().is_none() {
            clock.advance_us(10_000);
            sched.run_pending();
        }
        assert_eq!(result.borrow().as_ref().unwrap().len(), 1);
    }

    #[test]
    fn header_read_failure_degrades_to_empty() {
        let bus = MemBus::new();
        let dev = MemDevice::new(bus, 8192, 512);
        write_gpt(&dev, &[(2048, 4095, 0)]);
        dev.fail_next_admissions(1);
        assert!(run_reader(dev).is_empty());
    }
}
