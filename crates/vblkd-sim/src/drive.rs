//! An in-memory SATA disk with an IDENTIFY page builder.
//!
//! Sector storage is sparse, so multi-gigabyte test disks cost only what is
//! actually written.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub const SECTOR_SIZE: usize = 512;

pub struct SimDrive {
    serial: String,
    model: String,
    firmware: String,
    longaddr: bool,
    num_sectors: u64,
    sectors: RefCell<HashMap<u64, Box<[u8; SECTOR_SIZE]>>>,
}

impl SimDrive {
    /// A 48-bit-LBA DMA disk. The serial number is truncated to the 20
    /// characters the IDENTIFY field can carry.
    pub fn new(serial: &str, num_sectors: u64) -> Rc<Self> {
        Rc::new(Self {
            serial: serial.chars().take(20).collect(),
            model: "VBLKD SIM DRIVE".into(),
            firmware: "SIM1".into(),
            longaddr: true,
            num_sectors,
            sectors: RefCell::new(HashMap::new()),
        })
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn read(&self, lba: u64, buf: &mut [u8]) -> Result<(), ()> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(());
        }
        let count = (buf.len() / SECTOR_SIZE) as u64;
        if lba.checked_add(count).map_or(true, |end| end > self.num_sectors) {
            return Err(());
        }
        let sectors = self.sectors.borrow();
        for (i, chunk) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            match sectors.get(&(lba + i as u64)) {
                Some(sector) => chunk.copy_from_slice(&sector[..]),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    pub fn write(&self, lba: u64, buf: &[u8]) -> Result<(), ()> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(());
        }
        let count = (buf.len() / SECTOR_SIZE) as u64;
        if lba.checked_add(count).map_or(true, |end| end > self.num_sectors) {
            return Err(());
        }
        let mut sectors = self.sectors.borrow_mut();
        for (i, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
            let mut sector = Box::new([0u8; SECTOR_SIZE]);
            sector.copy_from_slice(chunk);
            sectors.insert(lba + i as u64, sector);
        }
        Ok(())
    }

    pub fn read_sector(&self, lba: u64) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.read(lba, &mut buf).unwrap();
        buf
    }

    pub fn write_sector(&self, lba: u64, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        self.write(lba, buf).unwrap();
    }

    pub fn fill_sector(&self, lba: u64, byte: u8) {
        self.write_sector(lba, &[byte; SECTOR_SIZE]);
    }

    /// Copy an image over the start of the disk, zero-padded to a sector
    /// boundary. The image must fit.
    pub fn load_image(&self, image: &[u8]) {
        let sectors = image.len().div_ceil(SECTOR_SIZE) as u64;
        assert!(sectors <= self.num_sectors, "image larger than the disk");
        let mut padded = image.to_vec();
        padded.resize(sectors as usize * SECTOR_SIZE, 0);
        self.write(0, &padded).unwrap();
    }

    /// The 512-byte IDENTIFY DEVICE response.
    pub fn identify_page(&self) -> [u8; 512] {
        let mut page = [0u8; 512];

        let mut put_word = |word: usize, val: u16| {
            page[word * 2..word * 2 + 2].copy_from_slice(&val.to_le_bytes());
        };

        put_word(49, (1 << 9) | (1 << 8)); // LBA + DMA
        let sectors28 = self.num_sectors.min(0x0FFF_FFFF);
        put_word(60, sectors28 as u16);
        put_word(61, (sectors28 >> 16) as u16);
        put_word(80, 0x01F0); // ATA-5 and up
        put_word(81, 0x29);
        if self.longaddr {
            put_word(86, 1 << 10);
            put_word(100, self.num_sectors as u16);
            put_word(101, (self.num_sectors >> 16) as u16);
            put_word(102, (self.num_sectors >> 32) as u16);
            put_word(103, (self.num_sectors >> 48) as u16);
        }
        // Words 117/118 stay zero: 512-byte logical sectors.

        put_string(&mut page, 10, 10, &self.serial);
        put_string(&mut page, 23, 4, &self.firmware);
        put_string(&mut page, 27, 20, &self.model);

        page
    }
}

/// ID strings hold two characters per word, high byte first, space-padded.
fn put_string(page: &mut [u8; 512], word: usize, len_words: usize, s: &str) {
    let padded: Vec<u8> = s
        .bytes()
        .chain(std::iter::repeat(b' '))
        .take(len_words * 2)
        .collect();
    for (i, pair) in padded.chunks(2).enumerate() {
        let off = (word + i) * 2;
        page[off] = pair[1];
        page[off + 1] = pair[0];
    }
}
