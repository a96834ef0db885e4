//! Per-port state machine, slot pool and interrupt handling.
//!
//! Every blocking hardware wait is a poll errand; the poll budget for state
//! transitions is 10 retries of 5 ms each. Errand callbacks re-verify that
//! the port is still in the state they were scheduled from. A mismatch
//! means a newer transition overtook this one, and the callback only passes
//! the user continuation through.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{error, info, trace, warn};
use vblkd_block::{DeviceError, DmaSpace, InoutCallback, Result};
use vblkd_errand::Scheduler;

use crate::fis::{CommandMemory, Taskfile, MAX_PRDS};
use crate::regs::*;

/// Continuation passed through the port's asynchronous transitions.
pub type DoneCallback = Box<dyn FnOnce()>;

const POLL_RETRIES: u32 = 10;
const POLL_INTERVAL_US: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// No hardware association.
    Undefined,
    /// Register window assigned, device detected.
    Present,
    /// Initializing during device discovery.
    PresentInit,
    /// Device discovery finished.
    Attached,
    /// Port set up but DMA engine stopped.
    Disabled,
    Enabling,
    Disabling,
    /// Accepting I/O commands.
    Ready,
    /// I/O error occurred, reset required.
    Error,
    /// Reinitializing after failure.
    ErrorInit,
    /// Unrecoverable; the port is out of service.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    None,
    Ata,
    Atapi,
    PortMultiplier,
    EnclosureMgmt,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Reserved and (possibly) issued to hardware.
    Active,
    /// Completion observed; callback handed to the errand queue but the
    /// slot not yet reusable.
    Completing,
}

struct Slot {
    state: SlotState,
    callback: Option<InoutCallback>,
}

struct PortInner {
    index: usize,
    state: PortState,
    devtype: DeviceType,
    regs: RegisterBlock,
    buswidth: u8,
    dma: Rc<dyn DmaSpace>,
    mem: Option<CommandMemory>,
    slots: Vec<Slot>,
    sched: Scheduler,
}

impl PortInner {
    fn is_started(&self) -> bool {
        self.regs.read(PORT_CMD) & CMD_ST != 0
    }

    fn is_port_idle(&self) -> bool {
        self.regs.read(PORT_TFD) & TFD_STS_BSY == 0
    }

    fn no_command_list_override(&self) -> bool {
        self.regs.read(PORT_CMD) & CMD_CLO == 0
    }

    fn is_command_list_disabled(&self) -> bool {
        self.regs.read(PORT_CMD) & (CMD_CR | CMD_ST) == 0
    }

    fn is_fis_receive_disabled(&self) -> bool {
        self.regs.read(PORT_CMD) & (CMD_FR | CMD_FRE) == 0
    }

    fn is_enabled(&self) -> bool {
        self.regs.read(PORT_CMD) & CMD_CR != 0
    }

    fn current_command_slot(&self) -> usize {
        ((self.regs.read(PORT_CMD) >> CMD_CCS_SHIFT) & CMD_CCS_MASK) as usize
    }

    fn device_state(&self) -> u32 {
        self.regs.read(PORT_SSTS) & 0xF
    }

    fn device_present(&self) -> bool {
        self.device_state() == SSTS_DET_ESTABLISHED
    }

    fn device_ready(&self) -> bool {
        self.devtype != DeviceType::None && self.device_present()
    }

    fn enable_ints(&self) {
        if self.devtype != DeviceType::None {
            self.regs.write(PORT_IE, IS_MASK_NONFATAL);
        }
    }

    fn dump_registers(&self) {
        trace!(
            port = self.index,
            clb = format_args!("{:#010x}", self.regs.read(PORT_CLB)),
            fb = format_args!("{:#010x}", self.regs.read(PORT_FB)),
            is = format_args!("{:#010x}", self.regs.read(PORT_IS)),
            ie = format_args!("{:#010x}", self.regs.read(PORT_IE)),
            cmd = format_args!("{:#010x}", self.regs.read(PORT_CMD)),
            tfd = format_args!("{:#010x}", self.regs.read(PORT_TFD)),
            ssts = format_args!("{:#010x}", self.regs.read(PORT_SSTS)),
            serr = format_args!("{:#010x}", self.regs.read(PORT_SERR)),
            ci = format_args!("{:#010x}", self.regs.read(PORT_CI)),
            "port registers"
        );
    }
}

/// One SATA link of the HBA. Clones share the same port.
#[derive(Clone)]
pub struct Port(Rc<RefCell<PortInner>>);

impl Port {
    /// Bind a port object to its register window.
    ///
    /// Fails with `NotFound` when no device has established communication on
    /// the link; an established device of a type the driver cannot serve
    /// still yields a port (with its type recorded) so the caller can log
    /// and skip it.
    pub fn attach(
        index: usize,
        regs: RegisterBlock,
        buswidth: u8,
        dma: Rc<dyn DmaSpace>,
        sched: Scheduler,
    ) -> Result<Port> {
        let mut inner = PortInner {
            index,
            state: PortState::Present,
            devtype: DeviceType::None,
            regs,
            buswidth,
            dma,
            mem: None,
            slots: Vec::new(),
            sched,
        };

        if !inner.device_present() {
            return Err(DeviceError::NotFound);
        }

        // Device detection via the signature register, as Linux does it.
        let sig = inner.regs.read(PORT_SIG);
        let devtype = match sig {
            SATA_SIG_ATA => DeviceType::Ata,
            SATA_SIG_ATAPI => DeviceType::Atapi,
            SATA_SIG_PMP => DeviceType::PortMultiplier,
            SATA_SIG_SEMB => DeviceType::EnclosureMgmt,
            _ => DeviceType::Unknown,
        };
        trace!(port = index, sig = format_args!("{sig:#010x}"), ?devtype, "attached port");
        inner.devtype = devtype;
        Ok(Port(Rc::new(RefCell::new(inner))))
    }

    pub fn index(&self) -> usize {
        self.0.borrow().index
    }

    pub fn state(&self) -> PortState {
        self.0.borrow().state
    }

    pub fn device_type(&self) -> DeviceType {
        self.0.borrow().devtype
    }

    pub fn bus_width(&self) -> u8 {
        self.0.borrow().buswidth
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PortState::Ready
    }

    pub fn max_slots(&self) -> usize {
        self.0.borrow().slots.len()
    }

    pub fn dma_space(&self) -> Rc<dyn DmaSpace> {
        self.0.borrow().dma.clone()
    }

    fn set_state(&self, state: PortState) {
        self.0.borrow_mut().state = state;
    }

    fn sched(&self) -> Scheduler {
        self.0.borrow().sched.clone()
    }

    /// Set up the command list, FIS receive area and slot pool.
    ///
    /// Slots whose bits are set in CI or SACT stay reserved: they are
    /// hardware-in-flight leftovers that only an abort may release.
    pub fn initialize_memory(&self, maxslots: usize) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.state != PortState::Attached {
            return Err(DeviceError::Fatal);
        }
        if inner.devtype == DeviceType::None {
            return Err(DeviceError::NotFound);
        }

        inner.regs.write(PORT_IE, 0);

        let mem = CommandMemory::new(&inner.dma, maxslots)?;
        info!(port = inner.index, slots = maxslots, "initializing port memory");

        let clb = mem.clb_bus();
        inner.regs.write(PORT_CLB, clb as u32);
        inner.regs.write(PORT_CLBU, (clb >> 32) as u32);
        let fb = mem.fb_bus();
        inner.regs.write(PORT_FB, fb as u32);
        inner.regs.write(PORT_FBU, (fb >> 32) as u32);

        inner.regs.set_bits(PORT_CMD, CMD_FRE);
        inner.regs.write(PORT_SERR, 0xFFFF_FFFF);

        let active = inner.regs.read(PORT_CI) | inner.regs.read(PORT_SACT);
        inner.slots = (0..maxslots)
            .map(|i| Slot {
                state: if active & (1 << i) != 0 {
                    SlotState::Active
                } else {
                    SlotState::Free
                },
                callback: None,
            })
            .collect();

        inner.mem = Some(mem);
        inner.state = PortState::Disabled;
        inner.dump_registers();
        Ok(())
    }

    /// Stop the command list and FIS receive engines.
    ///
    /// `Present -> PresentInit -> Attached` during discovery and
    /// `Error -> ErrorInit -> Disabled` during recovery.
    pub fn initialize(&self, cb: DoneCallback) {
        {
            let mut inner = self.0.borrow_mut();
            match inner.state {
                PortState::Present => inner.state = PortState::PresentInit,
                PortState::Error => inner.state = PortState::ErrorInit,
                state => {
                    error!(port = inner.index, ?state, "initialize called out of order");
                    inner.state = PortState::Fatal;
                    drop(inner);
                    cb();
                    return;
                }
            }
            trace!(port = inner.index, "port: starting reset");

            if inner.is_command_list_disabled() {
                drop(inner);
                self.disable_fis_receive(cb);
                return;
            }
            inner.regs.clear_bits(PORT_CMD, CMD_ST);
        }

        let port = self.clone();
        let poll_port = self.clone();
        self.sched().poll(
            POLL_RETRIES,
            POLL_INTERVAL_US,
            move || poll_port.0.borrow().is_command_list_disabled(),
            move |ok| {
                let state = port.state();
                if state != PortState::PresentInit && state != PortState::ErrorInit {
                    warn!(port = port.index(), ?state, "unexpected state in port initialize");
                    cb();
                } else if ok {
                    port.disable_fis_receive(cb);
                } else {
                    error!(port = port.index(), "command list disable failed");
                    port.0.borrow().dump_registers();
                    port.set_state(PortState::Fatal);
                    cb();
                }
            },
        );
    }

    fn init_target_state(from: PortState) -> PortState {
        if from == PortState::PresentInit {
            PortState::Attached
        } else {
            PortState::Disabled
        }
    }

    fn disable_fis_receive(&self, cb: DoneCallback) {
        {
            let inner = self.0.borrow();
            if inner.is_fis_receive_disabled() {
                let next = Self::init_target_state(inner.state);
                drop(inner);
                self.set_state(next);
                cb();
                return;
            }
            inner.regs.clear_bits(PORT_CMD, CMD_FRE);
        }

        let port = self.clone();
        let poll_port = self.clone();
        self.sched().poll(
            POLL_RETRIES,
            POLL_INTERVAL_US,
            move || poll_port.0.borrow().is_fis_receive_disabled(),
            move |ok| {
                let state = port.state();
                if state != PortState::PresentInit && state != PortState::ErrorInit {
                    warn!(port = port.index(), ?state, "unexpected state in port initialize");
                } else if ok {
                    port.set_state(Self::init_target_state(state));
                } else {
                    error!(port = port.index(), "FIS receive disable failed");
                    port.set_state(PortState::Fatal);
                }
                cb();
            },
        );
    }

    /// Put the port into processing mode: `Disabled -> Enabling -> Ready`.
    pub fn enable(&self, cb: DoneCallback) {
        {
            let mut inner = self.0.borrow_mut();
            if inner.state != PortState::Disabled {
                trace!(port = inner.index, state = ?inner.state, "enable skipped");
                drop(inner);
                cb();
                return;
            }
            inner.state = PortState::Enabling;

            if inner.is_port_idle() {
                drop(inner);
                self.dma_enable(cb);
                return;
            }
            // A busy task file blocks ST; request a command list override
            // and wait for the hardware to acknowledge it.
            inner.regs.set_bits(PORT_CMD, CMD_CLO);
        }

        let port = self.clone();
        let poll_port = self.clone();
        self.sched().poll(
            POLL_RETRIES,
            POLL_INTERVAL_US,
            move || poll_port.0.borrow().no_command_list_override(),
            move |ok| {
                if port.state() != PortState::Enabling {
                    warn!(port = port.index(), "unexpected state in port enable");
                    cb();
                } else if ok {
                    port.dma_enable(cb);
                } else {
                    port.set_state(PortState::Fatal);
                    cb();
                }
            },
        );
    }

    fn dma_enable(&self, cb: DoneCallback) {
        self.0.borrow().regs.set_bits(PORT_CMD, CMD_ST);

        let port = self.clone();
        let poll_port = self.clone();
        self.sched().poll(
            POLL_RETRIES,
            POLL_INTERVAL_US,
            move || poll_port.0.borrow().is_enabled(),
            move |ok| {
                if port.state() != PortState::Enabling {
                    warn!(port = port.index(), "unexpected state in port enable");
                    cb();
                } else if ok {
                    port.0.borrow().enable_ints();
                    port.set_state(PortState::Ready);
                    cb();
                } else {
                    port.set_state(PortState::Error);
                    port.disable(cb);
                }
            },
        );
    }

    /// Take the port out of processing mode: `-> Disabling -> Disabled`.
    pub fn disable(&self, cb: DoneCallback) {
        {
            let inner = self.0.borrow();
            inner.regs.write(PORT_IE, 0);
            inner.regs.clear_bits(PORT_CMD, CMD_ST);
            if inner.is_command_list_disabled() {
                drop(inner);
                self.set_state(PortState::Disabled);
                cb();
                return;
            }
        }
        self.set_state(PortState::Disabling);

        let port = self.clone();
        let poll_port = self.clone();
        self.sched().poll(
            POLL_RETRIES,
            POLL_INTERVAL_US,
            move || poll_port.0.borrow().is_command_list_disabled(),
            move |ok| {
                if port.state() != PortState::Disabling {
                    warn!(port = port.index(), "unexpected state in port disable");
                } else if ok {
                    port.set_state(PortState::Disabled);
                } else {
                    error!(port = port.index(), "could not disable port");
                    port.set_state(PortState::Fatal);
                }
                cb();
            },
        );
    }

    /// Disable the port, then cancel every outstanding request.
    pub fn abort(&self, cb: DoneCallback) {
        let port = self.clone();
        self.disable(Box::new(move || {
            port.abort_all_slots();
            cb();
        }));
    }

    /// Fail every reserved slot with an I/O error, synchronously.
    ///
    /// Callbacks are moved out of the slot pool before any of them runs, so
    /// a reset scheduled by the caller cannot race a completion.
    fn abort_all_slots(&self) {
        let aborted: Vec<(usize, InoutCallback)> = {
            let mut inner = self.0.borrow_mut();
            let mut out = Vec::new();
            for (i, slot) in inner.slots.iter_mut().enumerate() {
                if slot.state == SlotState::Active {
                    slot.state = SlotState::Free;
                    if let Some(cb) = slot.callback.take() {
                        out.push((i, cb));
                    }
                }
            }
            out
        };
        for (slot, cb) in aborted {
            trace!(port = self.index(), slot, "aborting slot");
            cb(Err(DeviceError::Io));
        }
    }

    /// Full port reset: SCTL comms-init for 5 ms, then wait for the device
    /// to report back and the task file to go idle.
    pub fn reset(&self, cb: DoneCallback) {
        info!(port = self.index(), "doing full port reset");
        self.0.borrow().regs.write(PORT_SCTL, 1);

        let port = self.clone();
        self.sched().schedule(5, move || {
            port.0.borrow().regs.write(PORT_SCTL, 0);

            let poll_port = port.clone();
            let done_port = port.clone();
            port.sched().poll(
                POLL_RETRIES,
                POLL_INTERVAL_US,
                move || poll_port.0.borrow().device_present(),
                move |ok| {
                    if ok {
                        done_port.wait_tfd(cb);
                    } else {
                        warn!(port = done_port.index(), "no device after port reset");
                        cb();
                    }
                },
            );
        });
    }

    fn wait_tfd(&self, cb: DoneCallback) {
        let poll_port = self.clone();
        let port = self.clone();
        self.sched().poll(
            POLL_RETRIES,
            POLL_INTERVAL_US,
            move || poll_port.0.borrow().is_port_idle(),
            move |ok| {
                if ok {
                    let inner = port.0.borrow();
                    inner.regs.write(PORT_SERR, 0xFFFF_FFFF);
                    inner.regs.write(PORT_IS, 0xFFFF_FFFF);
                }
                cb();
            },
        );
    }

    /// Place a new command. Returns the slot number used.
    ///
    /// If the port is not ready to issue, the slot is aborted on the spot:
    /// the callback has already reported an I/O error when this returns.
    pub fn send_command(&self, task: &Taskfile, cb: InoutCallback) -> Result<u32> {
        let aborted_cb;
        let slot;
        {
            let mut inner = self.0.borrow_mut();
            let inner = &mut *inner;
            // A fatal port is out of service for good.
            if inner.state == PortState::Fatal || !inner.device_ready() {
                return Err(DeviceError::NotFound);
            }
            if task.blocks.len() > MAX_PRDS {
                return Err(DeviceError::InvalidArgument("scatter list too long"));
            }

            let Some(idx) = inner.slots.iter().position(|s| s.state == SlotState::Free) else {
                return Err(DeviceError::Busy);
            };
            slot = idx;

            let mem = inner.mem.as_ref().expect("port memory initialized");
            mem.write_command(slot, task)?;
            mem.write_prds(slot, task.blocks)?;
            inner.slots[slot].state = SlotState::Active;
            inner.slots[slot].callback = Some(cb);
            trace!(port = inner.index, slot, "reserved slot");

            if inner.state == PortState::Ready {
                mem.flush(slot);
                inner.regs.write(PORT_CI, 1 << slot);
                aborted_cb = None;
            } else {
                trace!(port = inner.index, slot, "port not ready, aborting slot");
                inner.slots[slot].state = SlotState::Free;
                aborted_cb = inner.slots[slot].callback.take();
            }
        }

        if let Some(cb) = aborted_cb {
            cb(Err(DeviceError::Io));
        }
        Ok(slot as u32)
    }

    /// Process all pending interrupts for this port.
    pub fn process_interrupts(&self) -> Result<()> {
        let istate;
        {
            let inner = self.0.borrow();
            if inner.devtype == DeviceType::None {
                warn!(port = inner.index, "interrupt for inactive port");
                return Err(DeviceError::NotFound);
            }
            istate = inner.regs.read(PORT_IS);
        }

        if istate & IS_MASK_STATUS != 0 {
            warn!(port = self.index(), istate = format_args!("{istate:#010x}"),
                "device state changed, resetting port");
            // Abort everything in flight, then bring the port all the way
            // back up so clients keep their device.
            let reset_port = self.clone();
            self.abort(Box::new(move || {
                let enable_port = reset_port.clone();
                reset_port.reset(Box::new(move || {
                    let ready_port = enable_port.clone();
                    enable_port.enable(Box::new(move || {
                        if ready_port.is_ready() {
                            info!(port = ready_port.index(), "port recovered from state change");
                        }
                    }));
                }));
            }));
            self.0.borrow().regs.write(PORT_IS, istate);
            return Err(DeviceError::Io);
        }

        if istate & (IS_MASK_FATAL | IS_MASK_ERROR) != 0 {
            self.handle_error();
        } else {
            self.check_pending_commands();
        }

        self.0.borrow().regs.write(PORT_IS, istate);
        Ok(())
    }

    /// Walk CI and finish every reserved slot whose bit has cleared.
    ///
    /// Completions are deferred through the errand queue (we may be inside
    /// the interrupt handler); the slot itself is released immediately
    /// before its callback runs, in the same errand.
    fn check_pending_commands(&self) {
        let completed: Vec<(usize, u32, InoutCallback)> = {
            let mut inner = self.0.borrow_mut();
            let ci = inner.regs.read(PORT_CI);
            let prdbc: Vec<u32> = (0..inner.slots.len())
                .map(|i| inner.mem.as_ref().map(|m| m.prdbc(i)).unwrap_or(0))
                .collect();
            let mut out = Vec::new();
            for (i, slot) in inner.slots.iter_mut().enumerate() {
                if slot.state == SlotState::Active && ci & (1 << i) == 0 {
                    slot.state = SlotState::Completing;
                    if let Some(cb) = slot.callback.take() {
                        out.push((i, prdbc[i], cb));
                    }
                }
            }
            out
        };

        let sched = self.sched();
        for (slot, prdbc, cb) in completed {
            trace!(port = self.index(), slot, prdbc, "slot completed");
            let port = self.clone();
            sched.schedule(0, move || {
                port.release_slot(slot);
                cb(Ok(prdbc));
            });
        }
    }

    fn release_slot(&self, slot: usize) {
        let mut inner = self.0.borrow_mut();
        inner.slots[slot].state = SlotState::Free;
        inner.slots[slot].callback = None;
    }

    /// Error recovery: abort what failed, drop to `Error`, reinitialize,
    /// re-enable, and reissue the commands that survived.
    fn handle_error(&self) {
        let mut aborted: Vec<InoutCallback> = Vec::new();
        let reissue_mask;
        {
            let mut inner = self.0.borrow_mut();
            let ci = inner.regs.read(PORT_CI);

            if inner.is_started() {
                // The port is still running: only the current command
                // failed; everything else can be saved.
                let current = inner.current_command_slot();
                if current < inner.slots.len()
                    && inner.slots[current].state == SlotState::Active
                {
                    inner.slots[current].state = SlotState::Free;
                    if let Some(cb) = inner.slots[current].callback.take() {
                        aborted.push(cb);
                    }
                }
                reissue_mask = ci & !(1u32 << current);
            } else {
                for slot in inner.slots.iter_mut() {
                    if slot.state == SlotState::Active {
                        slot.state = SlotState::Free;
                        if let Some(cb) = slot.callback.take() {
                            aborted.push(cb);
                        }
                    }
                }
                reissue_mask = 0;
            }
            inner.state = PortState::Error;
        }

        warn!(
            port = self.index(),
            aborted = aborted.len(),
            reissue = format_args!("{reissue_mask:#010x}"),
            "handling port error"
        );
        for cb in aborted {
            cb(Err(DeviceError::Io));
        }

        // Completed-but-unreaped slots are picked up before recovery.
        self.check_pending_commands();

        let port = self.clone();
        self.initialize(Box::new(move || {
            {
                let inner = port.0.borrow();
                inner.regs.write(PORT_SERR, 0xFFFF_FFFF);
                inner.regs.write(PORT_IS, IS_MASK_FATAL | IS_MASK_ERROR);
            }
            let enable_port = port.clone();
            port.enable(Box::new(move || {
                if reissue_mask == 0 {
                    return;
                }
                if enable_port.is_ready() {
                    enable_port.0.borrow().regs.write(PORT_CI, reissue_mask);
                } else {
                    enable_port.abort_all_slots();
                }
            }));
        }));
    }
}
