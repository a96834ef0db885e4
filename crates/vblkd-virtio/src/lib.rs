//! Device-side virtio-block: split-ring parsing and the request pipeline
//! between a client's descriptor chains and a [`vblkd_block::BlockDevice`].

#![forbid(unsafe_code)]

pub mod blk;
pub mod queue;

pub use blk::{NotifyIrq, VirtioBlk, VirtioBlkConfig};
pub use queue::{DescriptorChain, Descriptor, GuestMem, GuestMemExt, PoppedChain, VirtQueue};
