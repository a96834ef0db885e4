//! AHCI driver core: register access, the per-port command engine, the
//! controller wrapper and the ATA device layer.
//!
//! The crate drives hardware through the [`vblkd_block::MmioSpace`] and
//! [`vblkd_block::DmaSpace`] contracts and never blocks: every hardware wait
//! is a poll errand on the shared [`vblkd_errand::Scheduler`].

#![forbid(unsafe_code)]

#[cfg(target_endian = "big")]
compile_error!("big-endian hosts are not supported; all register and wire formats are little-endian");

pub mod device;
pub mod fis;
pub mod hba;
pub mod port;
pub mod regs;

pub use device::{decode_identify, AhciDevice};
pub use fis::{CommandMemory, Taskfile, MAX_PRDS};
pub use hba::{Hba, HbaOptions};
pub use port::{DeviceType, DoneCallback, Port, PortState};
