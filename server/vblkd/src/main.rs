//! Native runner for the vblkd driver stack.
//!
//! Brings the driver up against the simulated controller, with a raw disk
//! image attached, and reports what was discovered. The hardware contracts
//! (`MmioSpace`, `PciConfig`, DMA) are the same ones a platform backend
//! implements on a real system.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vblkd::Driver;
use vblkd_ahci::{Hba, HbaOptions};
use vblkd_block::{DmaSpace, MmioSpace};
use vblkd_errand::{MonotonicClock, Scheduler, TimeSource};
use vblkd_sim::{SimDrive, SimHba, SECTOR_SIZE};
use vblkd_virtio::NotifyIrq;

#[derive(Debug, Parser)]
#[command(about = "AHCI-to-virtio block driver (simulated-controller runner)")]
struct Args {
    /// Raw disk image to attach (padded to a sector multiple).
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Disk size in MiB when no image is given.
    #[arg(long, default_value_t = 64)]
    disk_size: u64,

    /// Serial number of the simulated disk (20 characters at most).
    #[arg(long, default_value = "VBLKDSIM0001")]
    serial: String,

    /// Raise the log level; repeat for more.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence warnings.
    #[arg(short = 'q')]
    quiet: bool,

    /// Disable the 64-bit-host/32-bit-device address width check.
    #[arg(short = 'A')]
    no_address_width_check: bool,

    /// Static clients of the form cap,disk_id,num_ds.
    #[arg(value_name = "cap,disk_id,num_ds")]
    clients: Vec<String>,
}

struct NullNotify;

impl NotifyIrq for NullNotify {
    fn trigger(&self) {}
}

fn init_logging(args: &Args) {
    let default = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Parse a `cap,disk_id,num_ds` static client argument.
fn parse_client(entry: &str) -> Result<(String, String, usize)> {
    let mut parts = entry.splitn(3, ',');
    let cap = parts.next().unwrap_or_default();
    let device = parts
        .next()
        .context("missing disk_id in static client specification")?;
    let num_ds: usize = parts
        .next()
        .context("missing number of dataspaces in static client specification")?
        .parse()
        .context("cannot parse number of dataspaces")?;
    if cap.is_empty() || device.is_empty() {
        bail!("empty capability or disk_id");
    }
    if !(1..=256).contains(&num_ds) {
        bail!("number of dataspaces out of range");
    }
    Ok((cap.to_string(), device.to_string(), num_ds))
}

fn build_drive(args: &Args) -> Result<Rc<SimDrive>> {
    match &args.disk {
        Some(path) => {
            let image = std::fs::read(path)
                .with_context(|| format!("cannot read disk image {}", path.display()))?;
            let sectors = (image.len().div_ceil(SECTOR_SIZE)).max(1) as u64;
            let drive = SimDrive::new(&args.serial, sectors);
            drive.load_image(&image);
            Ok(drive)
        }
        None => Ok(SimDrive::new(
            &args.serial,
            args.disk_size * 1024 * 1024 / SECTOR_SIZE as u64,
        )),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let drive = build_drive(&args)?;
    let sim = SimHba::new(1, 32);
    sim.attach_drive(0, drive);

    let clock = Rc::new(MonotonicClock::new());
    let sched = Scheduler::new(clock.clone());

    let mmio: Rc<dyn MmioSpace> = sim.clone();
    let dma: Rc<dyn DmaSpace> = sim.bus();
    let hba = Hba::new(
        mmio,
        &*sim,
        dma,
        sched.clone(),
        sim.bar_len(),
        HbaOptions {
            check_address_width: !args.no_address_width_check,
        },
    )
    .context("controller bring-up failed")?;
    hba.enable_interrupts();

    let driver = Driver::new(sched.clone());
    for entry in &args.clients {
        match parse_client(entry) {
            Ok((cap, device, num_ds)) => {
                driver.add_static_client(&cap, &device, num_ds, Rc::new(NullNotify));
            }
            Err(err) => tracing::warn!(entry = %entry, %err, "invalid client description ignored"),
        }
    }

    driver.start_device_discovery(&hba);

    // The dispatch loop: interrupts first, then due errands, then sleep
    // until the next deadline. Discovery has quiesced when nothing is left.
    let irq = sim.irq();
    loop {
        if irq.level() {
            hba.handle_irq();
            continue;
        }
        if sched.run_pending() > 0 {
            continue;
        }
        match sched.next_deadline_us() {
            Some(deadline) => {
                let now = clock.now_us();
                if deadline > now {
                    std::thread::sleep(Duration::from_micros(deadline - now));
                }
            }
            None => break,
        }
    }

    for dev in driver.device_summaries() {
        println!(
            "disk {:<20} {:>12} sectors of {} bytes",
            dev.hid, dev.num_sectors, dev.sector_size
        );
        for guid in &dev.partitions {
            println!("  partition {guid}");
        }
    }
    for (cap, _) in driver.static_interfaces() {
        println!("static client bound: {cap}");
    }
    if driver.scanning() > 0 {
        bail!("{} device(s) never finished scanning", driver.scanning());
    }

    Ok(())
}
