//! A software AHCI controller, SATA drive and interrupt line.
//!
//! The simulator sits behind the same [`vblkd_block::MmioSpace`],
//! [`vblkd_block::PciConfig`] and DMA contracts the driver uses on real
//! hardware, so the whole driver stack runs unmodified against it, from the
//! port engine up to the virtio front end.

#![forbid(unsafe_code)]

mod drive;
mod hba;

pub use drive::{SimDrive, SECTOR_SIZE};
pub use hba::{SimHba, SimIrq};
