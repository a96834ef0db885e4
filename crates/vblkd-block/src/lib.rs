//! Block-device abstractions shared by the vblkd hardware and virtio layers.
//!
//! - [`Dataspace`] / [`DmaSpace`] / [`DmaRegion`]: memory a device can DMA
//!   into, with bus mappings released on drop
//! - [`BlockDevice`]: the seam between the request pipeline and a disk or
//!   partition view
//! - [`PartitionedDevice`]: LBA-rebased view with its own in-flight cap
//! - [`gpt`]: partition table discovery through the request pipeline
//! - [`bus`]: memory-backed bus contracts for tests and the simulator

mod device;
mod error;
mod hw;
mod mem;
mod partition;

pub mod bus;
pub mod gpt;

pub use device::{BlockDevice, DeviceFeatures, DeviceInfo, InoutCallback};
pub use error::{DeviceError, Result};
pub use hw::{IrqLine, MmioSpace, PciConfig};
pub use mem::{Datablock, Dataspace, DmaDirection, DmaRegion, DmaSpace};
pub use partition::{PartitionInfo, PartitionedDevice};
