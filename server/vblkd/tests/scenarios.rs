//! End-to-end driver scenarios: discovery, client I/O through the virtio
//! front end, admission pressure, and error recovery.

mod common;

use std::rc::Rc;

use common::*;
use pretty_assertions::assert_eq;
use vblkd_block::DeviceError;
use vblkd_sim::SimDrive;

const SERIAL: &str = "TESTDISK000000000000";

fn one_gib_drive() -> Rc<SimDrive> {
    SimDrive::new(SERIAL, 2_097_152)
}

#[test]
fn identify_reports_the_disk_capacity() {
    let bench = Bench::new(1, 8, &[(0, one_gib_drive())]);
    bench.discover();

    let (iface, _irq) = bench.create(SERIAL, 1).expect("device by serial number");
    assert_eq!(iface.device_config().capacity, 2_097_152);
    assert_eq!(iface.device_config().blk_size, 512);
}

#[test]
fn client_read_returns_the_gpt_signature() {
    let drive = SimDrive::new(SERIAL, 8192);
    write_gpt(&drive, &[(TEST_GUID_BYTES, 2048, 4095)]);
    let bench = Bench::new(1, 8, &[(0, drive)]);
    bench.discover();

    let (iface, irq) = bench.create(SERIAL, 1).unwrap();
    let mut client = BlockClient::new(&iface);

    // Sector 0 (the protective MBR area) reads fine.
    let r0 = client.submit(VIRTIO_BLK_T_IN, 0, 512);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&r0), VIRTIO_BLK_S_OK);
    assert_eq!(client.used_entry(0), (u32::from(r0.head), 512));

    // LBA 1 starts with the GPT header signature.
    let r1 = client.submit(VIRTIO_BLK_T_IN, 1, 512);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&r1), VIRTIO_BLK_S_OK);
    assert_eq!(&client.read_data(&r1, 8), b"EFI PART");
    assert_eq!(irq.0.get(), 2);
}

#[test]
fn partition_create_binds_the_child_and_blocks_the_root() {
    let drive = SimDrive::new(SERIAL, 8192);
    write_gpt(&drive, &[(TEST_GUID_BYTES, 2048, 4095)]);
    let bench = Bench::new(1, 8, &[(0, drive)]);
    bench.discover();

    let (iface, _irq) = bench.create(TEST_GUID, 1).expect("partition by GUID");
    assert_eq!(iface.device_config().capacity, 2048);

    let err = bench.create(SERIAL, 1).unwrap_err();
    assert_eq!(err, DeviceError::Busy);
}

#[test]
fn partition_io_is_rebased_onto_the_parent_disk() {
    let drive = SimDrive::new(SERIAL, 8192);
    write_gpt(&drive, &[(TEST_GUID_BYTES, 2048, 4095)]);
    drive.fill_sector(2048, 0x42);
    let bench = Bench::new(1, 8, &[(0, drive.clone())]);
    bench.discover();

    let (iface, _irq) = bench.create(TEST_GUID, 1).unwrap();
    let mut client = BlockClient::new(&iface);

    // Partition sector 0 is disk sector 2048.
    let read = client.submit(VIRTIO_BLK_T_IN, 0, 512);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&read), VIRTIO_BLK_S_OK);
    assert!(client.read_data(&read, 512).iter().all(|&b| b == 0x42));

    // And a write through the partition lands there too.
    let payload = vec![0x77u8; 512];
    let write = client.submit(VIRTIO_BLK_T_OUT, 1, 512);
    client.write_data(write.data_addr, &payload);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&write), VIRTIO_BLK_S_OK);
    assert_eq!(drive.read_sector(2049), payload);
}

#[test]
fn sixteen_reads_against_eight_slots_all_complete_in_order() {
    let drive = SimDrive::new(SERIAL, 8192);
    for s in 0..16u64 {
        drive.fill_sector(s, s as u8 + 1);
    }
    let bench = Bench::new(1, 8, &[(0, drive)]);
    bench.discover();

    let (iface, _irq) = bench.create(SERIAL, 1).unwrap();
    let mut client = BlockClient::new(&iface);

    bench.sim.hold_commands(0, true);
    let subs: Vec<_> = (0..16u64)
        .map(|s| client.submit(VIRTIO_BLK_T_IN, s, 512))
        .collect();
    iface.kick();

    // Exactly the slot pool is in flight; the ninth request is parked.
    assert_eq!(bench.sim.port_ci(0).count_ones(), 8);
    assert_eq!(iface.pending_requests(), 1);
    assert_eq!(client.used_idx(), 0);

    bench.sim.hold_commands(0, false);
    bench.pump();

    assert_eq!(client.used_idx(), 16);
    for (i, sub) in subs.iter().enumerate() {
        assert_eq!(client.status(sub), VIRTIO_BLK_S_OK, "request {i}");
        // Completions preserve submission order in the used ring.
        assert_eq!(client.used_entry(i as u16), (u32::from(sub.head), 512));
        assert!(
            client.read_data(sub, 512).iter().all(|&b| b == i as u8 + 1),
            "payload {i}"
        );
    }
    assert_eq!(iface.pending_requests(), 0);
}

#[test]
fn short_descriptor_chain_fails_the_device_without_touching_hardware() {
    let bench = Bench::new(1, 8, &[(0, one_gib_drive())]);
    bench.discover();

    let (iface, irq) = bench.create(SERIAL, 1).unwrap();
    let mut client = BlockClient::new(&iface);

    // One descriptor, shorter than the request header.
    let head = client.alloc_descs(1);
    client.write_desc(head, DATA, 8, 0, 0);
    client.push_avail(head);
    iface.kick();
    bench.pump();

    assert!(iface.is_failed());
    assert_eq!(client.used_idx(), 1);
    assert_eq!(bench.sim.port_ci(0), 0);
    assert_eq!(irq.0.get(), 0);
}

#[test]
fn connect_change_interrupt_fails_inflight_io_and_the_port_recovers() {
    const IS_PCS: u32 = 1 << 6;

    let drive = SimDrive::new(SERIAL, 8192);
    drive.fill_sector(5, 0x55);
    let bench = Bench::new(1, 8, &[(0, drive)]);
    bench.discover();

    let (iface, _irq) = bench.create(SERIAL, 1).unwrap();
    let mut client = BlockClient::new(&iface);

    // The read is sitting in a slot when the connect-change fires.
    bench.sim.hold_commands(0, true);
    let read = client.submit(VIRTIO_BLK_T_IN, 5, 512);
    iface.kick();
    assert_eq!(bench.sim.port_ci(0).count_ones(), 1);

    bench.sim.raise_port_interrupt(0, IS_PCS);
    bench.pump();
    assert_eq!(client.status(&read), VIRTIO_BLK_S_IOERR);

    // The port reset and re-enabled behind the scenes; the device still
    // serves the client.
    bench.sim.hold_commands(0, false);
    let retry = client.submit(VIRTIO_BLK_T_IN, 5, 512);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&retry), VIRTIO_BLK_S_OK);
    assert!(client.read_data(&retry, 512).iter().all(|&b| b == 0x55));
}

#[test]
fn write_then_read_roundtrip() {
    let bench = Bench::new(1, 8, &[(0, one_gib_drive())]);
    bench.discover();

    let (iface, _irq) = bench.create(SERIAL, 1).unwrap();
    let mut client = BlockClient::new(&iface);

    let payload: Vec<u8> = (0..2048u32).map(|i| (i * 7 + 3) as u8).collect();
    let write = client.submit(VIRTIO_BLK_T_OUT, 100, 2048);
    client.write_data(write.data_addr, &payload);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&write), VIRTIO_BLK_S_OK);

    let read = client.submit(VIRTIO_BLK_T_IN, 100, 2048);
    iface.kick();
    bench.pump();
    assert_eq!(client.status(&read), VIRTIO_BLK_S_OK);
    assert_eq!(client.read_data(&read, 2048), payload);
}
