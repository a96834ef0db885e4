//! Controller-wide management: bring-up, port discovery, interrupt demux.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, trace, warn};
use vblkd_block::{DeviceError, DmaSpace, MmioSpace, PciConfig, Result};
use vblkd_errand::Scheduler;

use crate::port::{Port, PortState};
use crate::regs::*;

const MAX_PORTS: usize = 32;

const PCI_COMMAND: u32 = 0x04;
const PCI_COMMAND_BUS_MASTER: u16 = 1 << 2;

#[derive(Debug, Clone, Copy)]
pub struct HbaOptions {
    /// Refuse to drive 32-bit-addressing controllers from a 64-bit host.
    /// The DMA allocator cannot promise memory below 4 GiB, so this is only
    /// safe to switch off when the platform keeps physical memory low.
    pub check_address_width: bool,
}

impl Default for HbaOptions {
    fn default() -> Self {
        Self {
            check_address_width: true,
        }
    }
}

/// One AHCI host bus adapter and its ports.
pub struct Hba {
    regs: RegisterBlock,
    cap: HbaCap,
    ports: Vec<Option<Port>>,
    sched: Scheduler,
}

impl Hba {
    /// Bring the controller into AHCI mode and attach its implemented ports.
    ///
    /// `bar_len` is the size of the mapped register window; ports that do
    /// not fit are not driven.
    pub fn new(
        mmio: Rc<dyn MmioSpace>,
        pci: &dyn PciConfig,
        dma: Rc<dyn DmaSpace>,
        sched: Scheduler,
        bar_len: usize,
        opts: HbaOptions,
    ) -> Result<Self> {
        let regs = RegisterBlock::new(mmio, 0);

        let cmd = pci.read16(PCI_COMMAND);
        if cmd & PCI_COMMAND_BUS_MASTER == 0 {
            trace!("enabling PCI bus master");
            pci.write16(PCI_COMMAND, cmd | PCI_COMMAND_BUS_MASTER);
        }

        regs.set_bits(HBA_GHC, GHC_AE);

        let cap = HbaCap(regs.read(HBA_CAP));
        trace!(
            cap = format_args!("{:#010x}", cap.0),
            cap2 = format_args!("{:#010x}", regs.read(HBA_CAP2)),
            vs = format_args!("{:#010x}", regs.read(HBA_VS)),
            "controller registers"
        );

        if opts.check_address_width && cfg!(target_pointer_width = "64") && !cap.s64a() {
            return Err(DeviceError::Unsupported);
        }

        let window_ports = bar_len.saturating_sub(PORT_BASE as usize) / PORT_STRIDE as usize;
        let max_ports = MAX_PORTS.min(window_ports);
        if (cap.np() as usize + 1) > max_ports {
            warn!(
                np = cap.np() + 1,
                max_ports, "controller reports more ports than the register window holds"
            );
        }

        let pi = regs.read(HBA_PI);
        trace!(pi = format_args!("{pi:#010x}"), "ports implemented");

        let buswidth = if cap.s64a() { 64 } else { 32 };
        let mut ports = Vec::with_capacity(max_ports);
        for idx in 0..max_ports {
            if pi & (1 << idx) == 0 {
                ports.push(None);
                continue;
            }
            let port_regs = regs.at(PORT_BASE + idx as u64 * PORT_STRIDE);
            match Port::attach(idx, port_regs, buswidth, dma.clone(), sched.clone()) {
                Ok(port) => {
                    trace!(port = idx, "registration of port done");
                    ports.push(Some(port));
                }
                Err(err) => {
                    trace!(port = idx, %err, "registration of port failed");
                    ports.push(None);
                }
            }
        }

        Ok(Self {
            regs,
            cap,
            ports,
            sched,
        })
    }

    pub fn features(&self) -> HbaCap {
        self.cap
    }

    /// Slot count every port of this controller uses.
    pub fn num_command_slots(&self) -> usize {
        self.cap.ncs() as usize + 1
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn port(&self, idx: usize) -> Option<&Port> {
        self.ports.get(idx).and_then(|p| p.as_ref())
    }

    /// Initialize and enable every populated port.
    ///
    /// `callback` runs once per port slot on the errand loop, with the port
    /// when it came up ready and `None` for absent or failed ports.
    pub fn scan_ports(&self, callback: impl FnMut(usize, Option<Port>) + 'static) {
        let ncs = self.num_command_slots();
        let callback = Rc::new(RefCell::new(callback));

        for (idx, entry) in self.ports.iter().enumerate() {
            let Some(port) = entry else {
                (callback.borrow_mut())(idx, None);
                continue;
            };

            let port = port.clone();
            let init_port = port.clone();
            let callback = callback.clone();
            port.initialize(Box::new(move || {
                if init_port.state() != PortState::Attached {
                    (callback.borrow_mut())(idx, None);
                    return;
                }
                if let Err(err) = init_port.initialize_memory(ncs) {
                    warn!(port = idx, %err, "could not set up port memory");
                    (callback.borrow_mut())(idx, None);
                    return;
                }
                let ready_port = init_port.clone();
                init_port.enable(Box::new(move || {
                    let result = ready_port.is_ready().then(|| ready_port.clone());
                    (callback.borrow_mut())(idx, result);
                }));
            }));
        }
    }

    /// Dispatch controller interrupts to the ports and acknowledge them.
    pub fn handle_irq(&self) {
        let is = self.regs.read(HBA_IS);
        for (idx, entry) in self.ports.iter().enumerate() {
            if is & (1 << idx) == 0 {
                continue;
            }
            match entry {
                Some(port) => {
                    let _ = port.process_interrupts();
                }
                None => warn!(port = idx, "interrupt for unpopulated port"),
            }
        }
        // Write-1-to-clear with the mask we actually observed.
        self.regs.write(HBA_IS, is);
    }

    /// Unmask controller interrupts. Call after the IRQ line is wired up.
    pub fn enable_interrupts(&self) {
        info!("enabling HBA interrupts");
        self.regs.write(HBA_IS, 0xFFFF_FFFF);
        self.regs.set_bits(HBA_GHC, GHC_IE);
    }

    pub fn disable_interrupts(&self) {
        self.regs.clear_bits(HBA_GHC, GHC_IE);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }
}
