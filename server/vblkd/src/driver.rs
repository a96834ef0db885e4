//! Device-to-client matching: the connection tree and the factory.
//!
//! Every discovered disk becomes a connection root; its partitions become
//! children once the partition scan finishes. Within one subtree at most one
//! node may be bound to a client interface at a time: a bound root blocks
//! all partitions, any bound partition blocks the root, and distinct
//! partitions can be served in parallel.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, trace, warn};
use vblkd_ahci::{AhciDevice, Hba};
use vblkd_block::{gpt, BlockDevice, DeviceError, PartitionedDevice, Result};
use vblkd_errand::Scheduler;
use vblkd_virtio::{NotifyIrq, VirtioBlk};

/// A client waiting for a device not (yet) known to the driver.
struct StaticClient {
    /// Name of the capability the interface binds to.
    cap: String,
    device_id: String,
    num_ds: usize,
    notify: Rc<dyn NotifyIrq>,
}

/// One device (disk or partition) and the interface possibly bound to it.
struct Connection {
    device: Rc<dyn BlockDevice>,
    iface: Option<VirtioBlk>,
    subs: Vec<Connection>,
}

impl Connection {
    fn new(device: Rc<dyn BlockDevice>) -> Self {
        Self {
            device,
            iface: None,
            subs: Vec::new(),
        }
    }

    /// True when the device or one of its partitions carries the HID.
    fn contains_device(&self, name: &str) -> bool {
        if self.device.info().hid == name {
            return true;
        }
        self.subs.iter().any(|sub| sub.contains_device(name))
    }

    /// Try to bind a new interface for `name` somewhere in this subtree.
    ///
    /// `NotFound` means "keep looking in other trees"; any other error is
    /// final for this create call.
    fn create_interface_for(
        &mut self,
        name: &str,
        num_ds: usize,
        notify: &Rc<dyn NotifyIrq>,
    ) -> Result<VirtioBlk> {
        if self.iface.is_some() {
            return if self.contains_device(name) {
                Err(DeviceError::Busy)
            } else {
                Err(DeviceError::NotFound)
            };
        }

        let mut subtree_busy = false;
        for sub in &mut self.subs {
            if sub.iface.is_some() {
                subtree_busy = true;
            }
            match sub.create_interface_for(name, num_ds, notify) {
                Err(DeviceError::NotFound) => continue,
                other => return other,
            }
        }

        // No partition matched; try the device itself.
        if self.device.info().hid == name {
            if subtree_busy {
                return Err(DeviceError::Busy);
            }
            let iface = VirtioBlk::new(self.device.clone(), num_ds, notify.clone());
            self.iface = Some(iface.clone());
            return Ok(iface);
        }

        Err(DeviceError::NotFound)
    }

    /// Unbind an interface, wherever in the subtree it lives.
    fn release_interface(&mut self, iface: &VirtioBlk) {
        if self.iface.as_ref().is_some_and(|own| own.same_as(iface)) {
            self.iface = None;
            return;
        }
        for sub in &mut self.subs {
            sub.release_interface(iface);
        }
    }
}

/// Summary of one discovered device, for logs and the CLI.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub hid: String,
    pub num_sectors: u64,
    pub sector_size: u32,
    pub partitions: Vec<String>,
}

struct DriverInner {
    sched: Scheduler,
    conns: Vec<Connection>,
    /// Devices discovered but still scanning.
    scanning: usize,
    static_clients: Vec<StaticClient>,
    static_interfaces: Vec<(String, VirtioBlk)>,
}

impl DriverInner {
    /// Replay waiting static clients against a freshly scanned connection.
    fn connect_static_clients(&mut self, conn_idx: usize) {
        let conn = &mut self.conns[conn_idx];
        let mut remaining = Vec::new();
        for client in self.static_clients.drain(..) {
            match conn.create_interface_for(&client.device_id, client.num_ds, &client.notify) {
                Ok(iface) => {
                    info!(cap = %client.cap, device = %client.device_id, "static client connected");
                    self.static_interfaces.push((client.cap, iface));
                }
                Err(DeviceError::NotFound) => remaining.push(client),
                Err(err) => {
                    warn!(cap = %client.cap, %err, "static client cannot be connected");
                    remaining.push(client);
                }
            }
        }
        self.static_clients = remaining;
    }
}

/// The driver server: owns the connection arena and implements the factory.
#[derive(Clone)]
pub struct Driver {
    inner: Rc<RefCell<DriverInner>>,
}

impl Driver {
    pub fn new(sched: Scheduler) -> Self {
        Self {
            inner: Rc::new(RefCell::new(DriverInner {
                sched,
                conns: Vec::new(),
                scanning: 0,
                static_clients: Vec::new(),
                static_interfaces: Vec::new(),
            })),
        }
    }

    /// Register a client that is attached as soon as its device appears.
    pub fn add_static_client(
        &self,
        cap: &str,
        device_id: &str,
        num_ds: usize,
        notify: Rc<dyn NotifyIrq>,
    ) {
        trace!(cap, device_id, num_ds, "adding static client");
        self.inner.borrow_mut().static_clients.push(StaticClient {
            cap: cap.to_string(),
            device_id: device_id.to_string(),
            num_ds,
            notify,
        });
    }

    /// Kick off device discovery on a controller. Returns immediately; the
    /// connection tree fills in as port scans, IDENTIFY and the partition
    /// reads complete on the errand loop.
    pub fn start_device_discovery(&self, hba: &Hba) {
        info!("starting device discovery");
        let driver = self.clone();
        hba.scan_ports(move |idx, port| {
            let Some(port) = port else {
                trace!(port = idx, "no usable device");
                return;
            };
            let Some(dev) = AhciDevice::create(&port) else {
                return;
            };
            driver.scan_device(dev);
        });
    }

    fn scan_device(&self, dev: Rc<AhciDevice>) {
        let sched = {
            let mut inner = self.inner.borrow_mut();
            inner.scanning += 1;
            inner.sched.clone()
        };

        let driver = self.clone();
        let scan_dev = dev.clone();
        let scan_sched = sched.clone();
        dev.start_device_scan(
            &sched,
            Box::new(move || {
                let base: Rc<dyn BlockDevice> = scan_dev;
                let reader_dev = base.clone();
                gpt::read_partition_table(reader_dev, scan_sched, move |parts| {
                    driver.add_connection(base, parts);
                });
            }),
        );
    }

    fn add_connection(&self, device: Rc<dyn BlockDevice>, parts: Vec<vblkd_block::PartitionInfo>) {
        let mut root = Connection::new(device.clone());
        for p in &parts {
            match PartitionedDevice::new(device.clone(), p) {
                Ok(pdev) => root.subs.push(Connection::new(pdev)),
                Err(err) => warn!(guid = %p.guid, %err, "skipping malformed partition"),
            }
        }

        let info = device.info();
        info!(
            hid = %info.hid,
            sectors = info.num_sectors,
            partitions = root.subs.len(),
            "device scanned"
        );

        let mut inner = self.inner.borrow_mut();
        inner.conns.push(root);
        inner.scanning -= 1;
        let idx = inner.conns.len() - 1;
        inner.connect_static_clients(idx);
    }

    /// The factory operation: create a virtio endpoint for the named device
    /// or partition.
    ///
    /// `grant_rights` models the capability rights the transport checked;
    /// without them the factory refuses.
    pub fn op_create(
        &self,
        grant_rights: bool,
        num_ds: i64,
        name: &str,
        notify: Rc<dyn NotifyIrq>,
    ) -> Result<VirtioBlk> {
        trace!(name, num_ds, "client requests connection");
        if !grant_rights {
            return Err(DeviceError::PermissionDenied);
        }
        if !(1..=256).contains(&num_ds) {
            return Err(DeviceError::InvalidArgument("dataspace count out of range"));
        }
        self.create(name, num_ds as usize, notify)
    }

    pub fn create(&self, name: &str, num_ds: usize, notify: Rc<dyn NotifyIrq>) -> Result<VirtioBlk> {
        let mut inner = self.inner.borrow_mut();
        for conn in &mut inner.conns {
            match conn.create_interface_for(name, num_ds, &notify) {
                Err(DeviceError::NotFound) => continue,
                other => return other,
            }
        }
        if inner.scanning > 0 {
            Err(DeviceError::Retry)
        } else {
            Err(DeviceError::NotFound)
        }
    }

    /// Disconnect a client interface so the device can be handed out again.
    pub fn release(&self, iface: &VirtioBlk) {
        let mut inner = self.inner.borrow_mut();
        for conn in &mut inner.conns {
            conn.release_interface(iface);
        }
        inner
            .static_interfaces
            .retain(|(_, own)| !own.same_as(iface));
    }

    /// Devices still being scanned.
    pub fn scanning(&self) -> usize {
        self.inner.borrow().scanning
    }

    /// Interfaces bound for static clients, as (capability, interface).
    pub fn static_interfaces(&self) -> Vec<(String, VirtioBlk)> {
        self.inner.borrow().static_interfaces.clone()
    }

    pub fn device_summaries(&self) -> Vec<DeviceSummary> {
        self.inner
            .borrow()
            .conns
            .iter()
            .map(|conn| {
                let info = conn.device.info();
                DeviceSummary {
                    hid: info.hid,
                    num_sectors: info.num_sectors,
                    sector_size: info.sector_size,
                    partitions: conn.subs.iter().map(|s| s.device.info().hid).collect(),
                }
            })
            .collect()
    }
}
