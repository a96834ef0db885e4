//! Shared test bench: simulated controller + driver + a minimal virtio
//! driver side that builds descriptor chains by hand.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use vblkd::Driver;
use vblkd_ahci::{Hba, HbaOptions};
use vblkd_block::{Dataspace, DmaSpace, MmioSpace, Result};
use vblkd_errand::{ManualClock, Scheduler, TimeSource};
use vblkd_sim::{SimDrive, SimHba, SimIrq};
use vblkd_virtio::{NotifyIrq, VirtioBlk};

pub const TEST_GUID: &str = "01234567-89AB-CDEF-0123-456789ABCDEF";
pub const TEST_GUID_BYTES: [u8; 16] = [
    0x67, 0x45, 0x23, 0x01, 0xAB, 0x89, 0xEF, 0xCD, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF,
];

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

#[derive(Debug, Default)]
pub struct CountingIrq(pub Cell<u32>);

impl NotifyIrq for CountingIrq {
    fn trigger(&self) {
        self.0.set(self.0.get() + 1);
    }
}

pub struct Bench {
    pub sim: Rc<SimHba>,
    pub hba: Hba,
    pub clock: ManualClock,
    pub sched: Scheduler,
    pub irq: SimIrq,
    pub driver: Driver,
}

impl Bench {
    pub fn new(num_ports: usize, slots: u32, drives: &[(usize, Rc<SimDrive>)]) -> Self {
        let sim = SimHba::new(num_ports, slots);
        for (port, drive) in drives {
            sim.attach_drive(*port, drive.clone());
        }
        let clock = ManualClock::new();
        let sched = Scheduler::new(Rc::new(clock.clone()));
        let mmio: Rc<dyn MmioSpace> = sim.clone();
        let dma: Rc<dyn DmaSpace> = sim.bus();
        let hba = Hba::new(
            mmio,
            &*sim,
            dma,
            sched.clone(),
            sim.bar_len(),
            HbaOptions::default(),
        )
        .expect("controller bring-up");
        hba.enable_interrupts();
        let irq = sim.irq();
        let driver = Driver::new(sched.clone());
        Self {
            sim,
            hba,
            clock,
            sched,
            irq,
            driver,
        }
    }

    /// Run discovery to quiescence.
    pub fn discover(&self) {
        self.driver.start_device_discovery(&self.hba);
        self.pump();
    }

    /// One dispatch-loop step. Returns false when nothing is runnable
    /// without advancing time.
    pub fn step(&self) -> bool {
        if self.irq.level() {
            self.hba.handle_irq();
            return true;
        }
        self.sched.run_pending() > 0
    }

    /// Dispatch until interrupts and errands quiesce, stepping virtual time
    /// over idle gaps.
    pub fn pump(&self) {
        for _ in 0..100_000 {
            if self.step() {
                continue;
            }
            match self.sched.next_deadline_us() {
                Some(deadline) => {
                    let now = self.clock.now_us();
                    self.clock.advance_us(deadline.saturating_sub(now).max(1));
                }
                None => return,
            }
        }
        panic!("dispatch loop did not quiesce");
    }

    /// Dispatch until the predicate holds.
    pub fn pump_until(&self, mut pred: impl FnMut() -> bool) {
        for _ in 0..100_000 {
            if pred() {
                return;
            }
            if self.step() {
                continue;
            }
            match self.sched.next_deadline_us() {
                Some(deadline) => {
                    let now = self.clock.now_us();
                    self.clock.advance_us(deadline.saturating_sub(now).max(1));
                }
                None => panic!("quiesced before the condition held"),
            }
        }
        panic!("condition never held");
    }

    pub fn create(&self, name: &str, num_ds: i64) -> Result<(VirtioBlk, Rc<CountingIrq>)> {
        let irq = Rc::new(CountingIrq::default());
        let iface = self.driver.op_create(true, num_ds, name, irq.clone())?;
        Ok((iface, irq))
    }
}

/// Lay a GPT onto the drive: header at LBA 1, entry array at LBA 2.
pub fn write_gpt(drive: &SimDrive, parts: &[([u8; 16], u64, u64)]) {
    let mut hdr = vec![0u8; 512];
    hdr[0..8].copy_from_slice(b"EFI PART");
    hdr[72..80].copy_from_slice(&2u64.to_le_bytes()); // entry array LBA
    hdr[80..84].copy_from_slice(&(parts.len() as u32).to_le_bytes());
    hdr[84..88].copy_from_slice(&128u32.to_le_bytes()); // entry size
    drive.write_sector(1, &hdr);

    let mut array = vec![0u8; (parts.len() * 128).div_ceil(512).max(1) * 512];
    for (i, (guid, first, last)) in parts.iter().enumerate() {
        let off = i * 128;
        array[off + 16..off + 32].copy_from_slice(guid);
        array[off + 32..off + 40].copy_from_slice(&first.to_le_bytes());
        array[off + 40..off + 48].copy_from_slice(&last.to_le_bytes());
    }
    for (i, sector) in array.chunks(512).enumerate() {
        drive.write_sector(2 + i as u64, sector);
    }
}

/// A GUID that differs from [`TEST_GUID_BYTES`] in its first byte.
pub fn guid_with_seed(seed: u8) -> [u8; 16] {
    let mut guid = TEST_GUID_BYTES;
    guid[0] = seed;
    guid
}

const QUEUE_SIZE: u16 = 64;
const DESC_TABLE: u64 = 0x0;
const AVAIL_RING: u64 = 0x400;
const USED_RING: u64 = 0x800;
const HEADERS: u64 = 0x1000;
const STATUS: u64 = 0x1800;
pub const DATA: u64 = 0x2000;

/// Handles for one submitted request.
#[derive(Debug, Clone, Copy)]
pub struct Submitted {
    pub head: u16,
    pub status_addr: u64,
    pub data_addr: u64,
}

/// The client half of the virtio contract, operating on one shared
/// dataspace registered at client address 0.
pub struct BlockClient {
    pub ds: Dataspace,
    avail_idx: u16,
    next_desc: u16,
}

impl BlockClient {
    pub fn new(iface: &VirtioBlk) -> Self {
        let ds = Dataspace::new(0x40000);
        iface.register_ds(ds.clone(), 0).unwrap();
        iface
            .setup_queue(QUEUE_SIZE, DESC_TABLE, AVAIL_RING, USED_RING)
            .unwrap();
        Self {
            ds,
            avail_idx: 0,
            next_desc: 0,
        }
    }

    pub fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = (DESC_TABLE + u64::from(index) * 16) as usize;
        self.ds.write(base, &addr.to_le_bytes()).unwrap();
        self.ds.write(base + 8, &len.to_le_bytes()).unwrap();
        self.ds.write(base + 12, &flags.to_le_bytes()).unwrap();
        self.ds.write(base + 14, &next.to_le_bytes()).unwrap();
    }

    pub fn push_avail(&mut self, head: u16) {
        let slot = self.avail_idx % QUEUE_SIZE;
        self.ds
            .write((AVAIL_RING + 4 + u64::from(slot) * 2) as usize, &head.to_le_bytes())
            .unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.ds
            .write((AVAIL_RING + 2) as usize, &self.avail_idx.to_le_bytes())
            .unwrap();
    }

    pub fn alloc_descs(&mut self, n: u16) -> u16 {
        let first = self.next_desc;
        self.next_desc += n;
        assert!(self.next_desc <= QUEUE_SIZE);
        first
    }

    /// Build and publish a header/data/status chain.
    pub fn submit_at(&mut self, typ: u32, sector: u64, data_addr: u64, data_len: u32) -> Submitted {
        let head = self.alloc_descs(3);
        let hdr_addr = HEADERS + u64::from(head) * 0x20;
        self.ds.write(hdr_addr as usize, &typ.to_le_bytes()).unwrap();
        self.ds
            .write(hdr_addr as usize + 8, &sector.to_le_bytes())
            .unwrap();

        let status_addr = STATUS + u64::from(head);
        self.ds.write(status_addr as usize, &[0xAA]).unwrap();

        let data_flags = if typ == VIRTIO_BLK_T_IN {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        } else {
            VIRTQ_DESC_F_NEXT
        };
        self.write_desc(head, hdr_addr, 16, VIRTQ_DESC_F_NEXT, head + 1);
        self.write_desc(head + 1, data_addr, data_len, data_flags, head + 2);
        self.write_desc(head + 2, status_addr, 1, VIRTQ_DESC_F_WRITE, 0);
        self.push_avail(head);
        Submitted {
            head,
            status_addr,
            data_addr,
        }
    }

    pub fn submit(&mut self, typ: u32, sector: u64, data_len: u32) -> Submitted {
        let data_addr = DATA + u64::from(self.next_desc) * 0x1000;
        self.submit_at(typ, sector, data_addr, data_len)
    }

    pub fn status(&self, sub: &Submitted) -> u8 {
        let mut b = [0u8; 1];
        self.ds.read(sub.status_addr as usize, &mut b).unwrap();
        b[0]
    }

    pub fn used_idx(&self) -> u16 {
        let mut b = [0u8; 2];
        self.ds.read(USED_RING as usize + 2, &mut b).unwrap();
        u16::from_le_bytes(b)
    }

    pub fn used_entry(&self, i: u16) -> (u32, u32) {
        let base = (USED_RING + 4 + u64::from(i) * 8) as usize;
        let mut id = [0u8; 4];
        let mut len = [0u8; 4];
        self.ds.read(base, &mut id).unwrap();
        self.ds.read(base + 4, &mut len).unwrap();
        (u32::from_le_bytes(id), u32::from_le_bytes(len))
    }

    pub fn read_data(&self, sub: &Submitted, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.ds.read(sub.data_addr as usize, &mut buf).unwrap();
        buf
    }

    pub fn write_data(&self, addr: u64, buf: &[u8]) {
        self.ds.write(addr as usize, buf).unwrap();
    }
}
