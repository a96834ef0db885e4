//! Register-level model of an AHCI controller, driven through the same
//! [`MmioSpace`] contract the real hardware sits behind.
//!
//! Commands issued via PxCI are executed synchronously against the attached
//! [`SimDrive`]s unless completions are held; interrupt status propagates to
//! a level-triggered [`SimIrq`] line. The model covers what the driver
//! exercises: the command-list engine with PRDT DMA, IDENTIFY and
//! read/write commands, port resets via PxSCTL, and error injection.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;
use vblkd_block::bus::MemBus;
use vblkd_block::{IrqLine, MmioSpace, PciConfig};

use crate::drive::{SimDrive, SECTOR_SIZE};

const HBA_REG_CAP: u64 = 0x00;
const HBA_REG_GHC: u64 = 0x04;
const HBA_REG_IS: u64 = 0x08;
const HBA_REG_PI: u64 = 0x0C;
const HBA_REG_VS: u64 = 0x10;
const HBA_REG_CAP2: u64 = 0x24;

const PORT_BASE: u64 = 0x100;
const PORT_STRIDE: u64 = 0x80;

const PORT_REG_CLB: u64 = 0x00;
const PORT_REG_CLBU: u64 = 0x04;
const PORT_REG_FB: u64 = 0x08;
const PORT_REG_FBU: u64 = 0x0C;
const PORT_REG_IS: u64 = 0x10;
const PORT_REG_IE: u64 = 0x14;
const PORT_REG_CMD: u64 = 0x18;
const PORT_REG_TFD: u64 = 0x20;
const PORT_REG_SIG: u64 = 0x24;
const PORT_REG_SSTS: u64 = 0x28;
const PORT_REG_SCTL: u64 = 0x2C;
const PORT_REG_SERR: u64 = 0x30;
const PORT_REG_SACT: u64 = 0x34;
const PORT_REG_CI: u64 = 0x38;

const GHC_IE: u32 = 1 << 1;
const GHC_AE: u32 = 1 << 31;

const CMD_ST: u32 = 1 << 0;
const CMD_CLO: u32 = 1 << 3;
const CMD_FRE: u32 = 1 << 4;
const CMD_CCS_SHIFT: u32 = 8;
const CMD_FR: u32 = 1 << 14;
const CMD_CR: u32 = 1 << 15;

const IS_DHRS: u32 = 1 << 0;
const IS_TFES: u32 = 1 << 30;

const TFD_BSY: u32 = 1 << 7;
const TFD_DRDY_DSC: u32 = 0x50;
const TFD_ERR: u32 = 1 << 0;

const SATA_SIG_ATA: u32 = 0x0000_0101;
/// DET=3 (established), SPD=1, IPM=1.
const SSTS_PRESENT: u32 = (1 << 8) | (1 << 4) | 3;
/// DET=1: device detected, no communication yet.
const SSTS_DETECTED: u32 = (1 << 8) | (1 << 4) | 1;

const ATA_CMD_IDENTIFY: u8 = 0xEC;
const ATA_CMD_READ_DMA: u8 = 0xC8;
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_READ_SECTOR: u8 = 0x20;
const ATA_CMD_READ_SECTOR_EXT: u8 = 0x24;
const ATA_CMD_WRITE_DMA: u8 = 0xCA;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
const ATA_CMD_WRITE_SECTOR: u8 = 0x30;
const ATA_CMD_WRITE_SECTOR_EXT: u8 = 0x34;

/// Shareable level-triggered interrupt line.
#[derive(Clone, Default)]
pub struct SimIrq(Rc<SimIrqState>);

#[derive(Default)]
struct SimIrqState {
    level: Cell<bool>,
    transitions: RefCell<Vec<bool>>,
}

impl SimIrq {
    pub fn level(&self) -> bool {
        self.0.level.get()
    }

    pub fn transitions(&self) -> Vec<bool> {
        self.0.transitions.borrow().clone()
    }
}

impl IrqLine for SimIrq {
    fn set_level(&self, high: bool) {
        if self.0.level.get() != high {
            self.0.level.set(high);
            self.0.transitions.borrow_mut().push(high);
        }
    }
}

struct SimPort {
    clb: u64,
    fb: u64,
    is: u32,
    ie: u32,
    cmd: u32,
    tfd: u32,
    sig: u32,
    ssts: u32,
    sctl: u32,
    serr: u32,
    sact: u32,
    ci: u32,
    drive: Option<Rc<SimDrive>>,
    /// When set, issued commands stay pending until released.
    hold: bool,
    /// Fail that many commands with a task-file error.
    fail_budget: u32,
}

impl SimPort {
    fn new() -> Self {
        Self {
            clb: 0,
            fb: 0,
            is: 0,
            ie: 0,
            cmd: 0,
            tfd: 0,
            sig: 0,
            ssts: 0,
            sctl: 0,
            serr: 0,
            sact: 0,
            ci: 0,
            drive: None,
            hold: false,
            fail_budget: 0,
        }
    }

    fn attach(&mut self, drive: Rc<SimDrive>) {
        self.drive = Some(drive);
        self.sig = SATA_SIG_ATA;
        self.ssts = SSTS_PRESENT;
        self.tfd = TFD_DRDY_DSC;
    }

    fn running(&self) -> bool {
        self.cmd & CMD_ST != 0
    }

    /// CR and FR mirror ST and FRE immediately; the driver's stop/start
    /// polls observe the transition on their first read.
    fn update_running_bits(&mut self) {
        let st = self.cmd & CMD_ST != 0;
        let fre = self.cmd & CMD_FRE != 0;
        self.cmd &= !(CMD_FR | CMD_CR);
        if fre {
            self.cmd |= CMD_FR;
        }
        if st {
            self.cmd |= CMD_CR;
        }
    }
}

struct SimState {
    cap: u32,
    ghc: u32,
    pi: u32,
    ports: Vec<SimPort>,
    pci_command: u16,
}

/// The controller model. Hand clones of the `Rc` to the driver as its
/// `MmioSpace` and `PciConfig`.
pub struct SimHba {
    state: RefCell<SimState>,
    bus: Rc<MemBus>,
    irq: SimIrq,
}

impl SimHba {
    /// A controller with `num_ports` implemented ports and `slots` command
    /// slots per port.
    pub fn new(num_ports: usize, slots: u32) -> Rc<Self> {
        assert!((1..=32).contains(&num_ports));
        assert!((1..=32).contains(&slots));
        let np = (num_ports as u32 - 1) & 0x1F;
        let ncs = (slots - 1) << 8;
        let s64a = 1 << 31;
        Rc::new(Self {
            state: RefCell::new(SimState {
                cap: np | ncs | s64a,
                ghc: GHC_AE,
                pi: if num_ports >= 32 {
                    u32::MAX
                } else {
                    (1 << num_ports) - 1
                },
                ports: (0..num_ports).map(|_| SimPort::new()).collect(),
                pci_command: 0,
            }),
            bus: MemBus::new(),
            irq: SimIrq::default(),
        })
    }

    /// The bus the controller DMAs through; doubles as the driver's DMA
    /// space.
    pub fn bus(&self) -> Rc<MemBus> {
        self.bus.clone()
    }

    pub fn irq(&self) -> SimIrq {
        self.irq.clone()
    }

    pub fn bar_len(&self) -> usize {
        (PORT_BASE + self.state.borrow().ports.len() as u64 * PORT_STRIDE) as usize
    }

    pub fn attach_drive(&self, port: usize, drive: Rc<SimDrive>) {
        self.state.borrow_mut().ports[port].attach(drive);
    }

    /// Keep issued commands pending instead of completing them.
    pub fn hold_commands(&self, port: usize, hold: bool) {
        self.state.borrow_mut().ports[port].hold = hold;
        if !hold {
            self.process_port(port);
            self.update_irq();
        }
    }

    /// Fail the next `n` commands with a task-file error.
    pub fn fail_next_commands(&self, port: usize, n: u32) {
        self.state.borrow_mut().ports[port].fail_budget = n;
    }

    /// Assert port interrupt bits out of band, e.g. a connect-change.
    pub fn raise_port_interrupt(&self, port: usize, bits: u32) {
        self.state.borrow_mut().ports[port].is |= bits;
        self.update_irq();
    }

    pub fn port_ci(&self, port: usize) -> u32 {
        self.state.borrow().ports[port].ci
    }

    fn update_irq(&self) {
        let state = self.state.borrow();
        let pending =
            state.ghc & GHC_IE != 0 && state.ports.iter().any(|p| p.is & p.ie != 0);
        drop(state);
        self.irq.set_level(pending);
    }

    fn read_port(&self, port: usize, reg: u64) -> u32 {
        let state = self.state.borrow();
        let Some(p) = state.ports.get(port) else {
            return 0;
        };
        match reg {
            PORT_REG_CLB => p.clb as u32,
            PORT_REG_CLBU => (p.clb >> 32) as u32,
            PORT_REG_FB => p.fb as u32,
            PORT_REG_FBU => (p.fb >> 32) as u32,
            PORT_REG_IS => p.is,
            PORT_REG_IE => p.ie,
            PORT_REG_CMD => p.cmd,
            PORT_REG_TFD => p.tfd,
            PORT_REG_SIG => p.sig,
            PORT_REG_SSTS => p.ssts,
            PORT_REG_SCTL => p.sctl,
            PORT_REG_SERR => p.serr,
            PORT_REG_SACT => p.sact,
            PORT_REG_CI => p.ci,
            _ => 0,
        }
    }

    fn write_port(&self, port: usize, reg: u64, val: u32) {
        let mut process = false;
        {
            let mut state = self.state.borrow_mut();
            let Some(p) = state.ports.get_mut(port) else {
                return;
            };
            match reg {
                PORT_REG_CLB => p.clb = (p.clb & !0xFFFF_FFFF) | u64::from(val),
                PORT_REG_CLBU => p.clb = (p.clb & 0xFFFF_FFFF) | (u64::from(val) << 32),
                PORT_REG_FB => p.fb = (p.fb & !0xFFFF_FFFF) | u64::from(val),
                PORT_REG_FBU => p.fb = (p.fb & 0xFFFF_FFFF) | (u64::from(val) << 32),
                PORT_REG_IS => p.is &= !val,
                PORT_REG_IE => p.ie = val,
                PORT_REG_CMD => {
                    p.cmd = val & !(CMD_FR | CMD_CR);
                    if p.cmd & CMD_CLO != 0 {
                        // Override acknowledged at once: BSY drops, CLO
                        // self-clears.
                        p.tfd &= !TFD_BSY;
                        p.cmd &= !CMD_CLO;
                    }
                    p.update_running_bits();
                    process = p.running() && p.ci != 0;
                }
                PORT_REG_SCTL => {
                    if val & 0xF == 1 {
                        // COMRESET in progress: communication drops, any
                        // in-flight state is gone.
                        p.ssts = SSTS_DETECTED;
                        p.tfd = TFD_BSY;
                        p.ci = 0;
                        p.sact = 0;
                    } else if p.sctl & 0xF == 1 {
                        // Link comes back up.
                        if p.drive.is_some() {
                            p.ssts = SSTS_PRESENT;
                            p.tfd = TFD_DRDY_DSC;
                        }
                    }
                    p.sctl = val;
                }
                PORT_REG_SERR => p.serr &= !val,
                PORT_REG_SACT => p.sact |= val,
                PORT_REG_CI => {
                    p.ci |= val;
                    process = p.running() && !p.hold;
                }
                _ => {}
            }
        }
        if process {
            self.process_port(port);
        }
        self.update_irq();
    }

    /// Execute pending command slots, ascending.
    fn process_port(&self, port: usize) {
        loop {
            let (slot, header_addr, ctba, prdtl) = {
                let mut state = self.state.borrow_mut();
                let p = &mut state.ports[port];
                if p.ci == 0 || !p.running() || p.hold || p.clb == 0 {
                    return;
                }
                let slot = p.ci.trailing_zeros() as usize;

                if p.fail_budget > 0 {
                    p.fail_budget -= 1;
                    p.ci &= !(1 << slot);
                    p.tfd = TFD_DRDY_DSC | TFD_ERR;
                    p.cmd = (p.cmd & !(0x1F << CMD_CCS_SHIFT)) | ((slot as u32) << CMD_CCS_SHIFT);
                    p.is |= IS_TFES | IS_DHRS;
                    trace!(port, slot, "injected task-file error");
                    continue;
                }

                let header = p.clb + slot as u64 * 32;
                let flags = self.bus.read_u32(header).unwrap_or(0);
                let ctba = u64::from(self.bus.read_u32(header + 8).unwrap_or(0))
                    | (u64::from(self.bus.read_u32(header + 12).unwrap_or(0)) << 32);
                (slot, header, ctba, (flags >> 16) & 0xFFFF)
            };

            let result = self.execute_slot(port, ctba, prdtl as usize);

            let mut state = self.state.borrow_mut();
            let p = &mut state.ports[port];
            p.ci &= !(1 << slot as u32);
            match result {
                Ok(bytes) => {
                    let _ = self.bus.write_u32(header_addr + 4, bytes);
                    p.tfd = TFD_DRDY_DSC;
                    p.is |= IS_DHRS;
                }
                Err(()) => {
                    p.tfd = TFD_DRDY_DSC | TFD_ERR;
                    p.cmd =
                        (p.cmd & !(0x1F << CMD_CCS_SHIFT)) | ((slot as u32) << CMD_CCS_SHIFT);
                    p.is |= IS_TFES | IS_DHRS;
                }
            }
        }
    }

    fn execute_slot(&self, port: usize, ctba: u64, prdtl: usize) -> Result<u32, ()> {
        let drive = self.state.borrow().ports[port].drive.clone().ok_or(())?;

        let mut cfis = [0u8; 16];
        self.bus.read(ctba, &mut cfis).map_err(|_| ())?;
        if cfis[0] != 0x27 {
            return Err(());
        }
        let command = cfis[2];
        let lba = u64::from(cfis[4])
            | u64::from(cfis[5]) << 8
            | u64::from(cfis[6]) << 16
            | u64::from(cfis[8]) << 24
            | u64::from(cfis[9]) << 32
            | u64::from(cfis[10]) << 40;
        let count = {
            let raw = u32::from(cfis[12]) | u32::from(cfis[13]) << 8;
            if raw == 0 {
                65536
            } else {
                raw
            }
        };

        let prds = self.read_prds(ctba, prdtl)?;

        match command {
            ATA_CMD_IDENTIFY => {
                let page = drive.identify_page();
                self.dma_out(&prds, &page)?;
                Ok(page.len() as u32)
            }
            ATA_CMD_READ_DMA | ATA_CMD_READ_DMA_EXT | ATA_CMD_READ_SECTOR
            | ATA_CMD_READ_SECTOR_EXT => {
                let len = count as usize * SECTOR_SIZE;
                let mut data = vec![0u8; len];
                drive.read(lba, &mut data)?;
                self.dma_out(&prds, &data)?;
                Ok(len as u32)
            }
            ATA_CMD_WRITE_DMA | ATA_CMD_WRITE_DMA_EXT | ATA_CMD_WRITE_SECTOR
            | ATA_CMD_WRITE_SECTOR_EXT => {
                let len = count as usize * SECTOR_SIZE;
                let mut data = vec![0u8; len];
                self.dma_in(&prds, &mut data)?;
                drive.write(lba, &data)?;
                Ok(len as u32)
            }
            _ => {
                trace!(command, "unsupported ATA command");
                Err(())
            }
        }
    }

    fn read_prds(&self, ctba: u64, prdtl: usize) -> Result<Vec<(u64, usize)>, ()> {
        let mut prds = Vec::with_capacity(prdtl);
        for i in 0..prdtl {
            let entry = ctba + 0x80 + i as u64 * 16;
            let dba = u64::from(self.bus.read_u32(entry).map_err(|_| ())?)
                | (u64::from(self.bus.read_u32(entry + 4).map_err(|_| ())?) << 32);
            let dbc = self.bus.read_u32(entry + 12).map_err(|_| ())?;
            prds.push((dba, (dbc & 0x003F_FFFF) as usize + 1));
        }
        Ok(prds)
    }

    /// Device-to-host transfer through the PRD list.
    fn dma_out(&self, prds: &[(u64, usize)], mut src: &[u8]) -> Result<(), ()> {
        for &(dba, len) in prds {
            if src.is_empty() {
                break;
            }
            let chunk = len.min(src.len());
            self.bus.write(dba, &src[..chunk]).map_err(|_| ())?;
            src = &src[chunk..];
        }
        if src.is_empty() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Host-to-device transfer through the PRD list.
    fn dma_in(&self, prds: &[(u64, usize)], buf: &mut [u8]) -> Result<(), ()> {
        let mut filled = 0;
        for &(dba, len) in prds {
            if filled == buf.len() {
                break;
            }
            let chunk = len.min(buf.len() - filled);
            self.bus
                .read(dba, &mut buf[filled..filled + chunk])
                .map_err(|_| ())?;
            filled += chunk;
        }
        if filled == buf.len() {
            Ok(())
        } else {
            Err(())
        }
    }
}

impl MmioSpace for SimHba {
    fn read32(&self, offset: u64) -> u32 {
        if offset >= PORT_BASE {
            let port = ((offset - PORT_BASE) / PORT_STRIDE) as usize;
            return self.read_port(port, (offset - PORT_BASE) % PORT_STRIDE);
        }
        let state = self.state.borrow();
        match offset {
            HBA_REG_CAP => state.cap,
            HBA_REG_GHC => state.ghc,
            HBA_REG_IS => {
                let mut is = 0;
                for (idx, p) in state.ports.iter().enumerate() {
                    if p.is != 0 {
                        is |= 1 << idx;
                    }
                }
                is
            }
            HBA_REG_PI => state.pi,
            HBA_REG_VS => 0x0001_0300,
            HBA_REG_CAP2 => 0,
            _ => 0,
        }
    }

    fn write32(&self, offset: u64, val: u32) {
        if offset >= PORT_BASE {
            let port = ((offset - PORT_BASE) / PORT_STRIDE) as usize;
            self.write_port(port, (offset - PORT_BASE) % PORT_STRIDE, val);
            return;
        }
        match offset {
            HBA_REG_GHC => {
                // AE is sticky in this model; HR and the reserved bits are
                // ignored.
                self.state.borrow_mut().ghc = (val & GHC_IE) | GHC_AE;
                self.update_irq();
            }
            // The global IS is a read-only reflection of the per-port
            // registers here; clearing happens port by port.
            HBA_REG_IS => {}
            _ => {}
        }
    }
}

impl PciConfig for SimHba {
    fn read16(&self, reg: u32) -> u16 {
        match reg {
            0x04 => self.state.borrow().pci_command,
            _ => 0,
        }
    }

    fn write16(&self, reg: u32, val: u16) {
        if reg == 0x04 {
            self.state.borrow_mut().pci_command = val;
        }
    }
}
