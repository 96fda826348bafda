//! End-to-end tests against the in-process dummy hardware, from the
//! connection file down to the wire.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use ipbus_hal::{ConnectionManager, HalError, HwInterface, Mode, Permission, NOMASK};
use tempfile::TempDir;
use tl_udp::{DummyConfig, DummyHandle, DummyHardware, UdpError};

const TEST_TIMEOUT: Duration = Duration::from_millis(200);

fn write_file(dir: &Path, name: &str, contents: &str) {
    let mut file = std::fs::File::create(dir.join(name)).expect("create file");
    write!(file, "{contents}").expect("write file");
}

/// The standard test address table (see the metadata checks below).
fn write_tables(dir: &Path) {
    write_file(
        dir,
        "subsystem.xml",
        r#"<node>
             <node id="REG" address="0x1"/>
             <node id="MEM" address="0x2" size="0x40000" mode="incremental"/>
           </node>"#,
    );
    write_file(
        dir,
        "main.xml",
        r#"<node>
             <node id="REG" address="0x1" permission="rw" tags="test"/>
             <node id="REG_READ_ONLY" address="0x2" permission="r"/>
             <node id="REG_WRITE_ONLY" address="0x3" permission="w"/>
             <node id="REG_UPPER_MASK" address="0x4" mask="0xFFFF0000"/>
             <node id="REG_LOWER_MASK" address="0x4" mask="0x0000FFFF"/>
             <node id="FIFO" address="0x100" size="0x40000" mode="non-incremental"/>
             <node id="MEM" address="0x100000" size="0x40000" mode="incremental"/>
             <node id="SMALL_MEM" address="0x400000" size="0x100" mode="incremental"/>
             <node id="LARGE_MEM" address="0x500000" size="0x280000" mode="incremental"/>
             <node id="SUBSYSTEM1" address="0x200000" module="file://subsystem.xml" tags="test"/>
           </node>"#,
    );
}

async fn setup(config: DummyConfig) -> (DummyHandle, TempDir, HwInterface) {
    let handle = DummyHardware::spawn(config).await.expect("spawn dummy");
    let dir = tempfile::tempdir().expect("tempdir");
    write_tables(dir.path());
    write_file(
        dir.path(),
        "connections.xml",
        &format!(
            r#"<connections>
                 <connection id="dummy" uri="ipbusudp-2.0://{}"
                             address_table="file://main.xml"/>
               </connections>"#,
            handle.addr()
        ),
    );
    let manager =
        ConnectionManager::from_file(&dir.path().join("connections.xml")).expect("load manager");
    let hw = manager.get_device("dummy").expect("build device");
    hw.set_timeout(TEST_TIMEOUT);
    (handle, dir, hw)
}

#[tokio::test]
async fn metadata_matches_the_address_table() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;

    let reg = hw.get_node("REG").expect("REG");
    assert_eq!(reg.node().address(), 0x1);
    assert_eq!(reg.node().id(), "REG");
    assert_eq!(reg.node().permission(), Permission::ReadWrite);
    assert_eq!(reg.node().size(), 1);
    assert_eq!(reg.node().mask(), NOMASK);
    assert_eq!(reg.node().mode(), Mode::Single);
    assert_eq!(reg.node().tags(), "test");

    let read_only = hw.get_node("REG_READ_ONLY").expect("REG_READ_ONLY");
    assert_eq!(read_only.node().address(), 0x2);
    assert_eq!(read_only.node().permission(), Permission::Read);

    let write_only = hw.get_node("REG_WRITE_ONLY").expect("REG_WRITE_ONLY");
    assert_eq!(write_only.node().address(), 0x3);
    assert_eq!(write_only.node().permission(), Permission::Write);

    let upper = hw.get_node("REG_UPPER_MASK").expect("REG_UPPER_MASK");
    assert_eq!(upper.node().address(), 0x4);
    assert_eq!(upper.node().mask(), 0xFFFF_0000);
    let lower = hw.get_node("REG_LOWER_MASK").expect("REG_LOWER_MASK");
    assert_eq!(lower.node().address(), 0x4);
    assert_eq!(lower.node().mask(), 0x0000_FFFF);

    let fifo = hw.get_node("FIFO").expect("FIFO");
    assert_eq!(fifo.node().address(), 0x100);
    assert_eq!(fifo.node().size(), 262_144);
    assert_eq!(fifo.node().mode(), Mode::NonIncremental);

    let mem = hw.get_node("MEM").expect("MEM");
    assert_eq!(mem.node().address(), 0x100000);
    assert_eq!(mem.node().size(), 262_144);
    assert_eq!(mem.node().mode(), Mode::Incremental);

    assert_eq!(hw.get_node("SMALL_MEM").expect("SMALL_MEM").node().size(), 256);
    assert_eq!(
        hw.get_node("LARGE_MEM").expect("LARGE_MEM").node().size(),
        2_621_440
    );

    let sub_reg = hw.get_node("SUBSYSTEM1.REG").expect("SUBSYSTEM1.REG");
    assert_eq!(sub_reg.node().address(), 0x200001);
    assert_eq!(sub_reg.node().id(), "REG");
    assert_eq!(sub_reg.node().tags(), "test");
    let sub_mem = hw.get_node("SUBSYSTEM1.MEM").expect("SUBSYSTEM1.MEM");
    assert_eq!(sub_mem.node().address(), 0x200002);
    assert_eq!(sub_mem.node().mode(), Mode::Incremental);

    // The node listing covers every path exactly once.
    let nodes = hw.nodes();
    assert!(nodes.contains(&"SUBSYSTEM1.MEM".to_string()));
    let mut deduped = nodes.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), nodes.len());

    let matched = hw.nodes_matching("^SUBSYSTEM1\\.").expect("regex");
    assert_eq!(matched, vec!["SUBSYSTEM1.REG", "SUBSYSTEM1.MEM"]);
}

#[tokio::test]
async fn register_write_read_roundtrip() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    let ack = hw.get_node("REG").expect("node").write(0xCAFE_F00D).expect("write");
    let read = hw.get_node("REG").expect("node").read().expect("read");
    assert!(!ack.valid());
    assert!(!read.valid());
    hw.dispatch().await.expect("dispatch");
    assert!(ack.valid());
    assert!(read.valid());
    assert_eq!(read.value().expect("value"), 0xCAFE_F00D);
}

#[tokio::test]
async fn masked_write_is_read_modify_write() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;

    hw.get_node("REG_LOWER_MASK").expect("node").write(0x1234).expect("write");
    hw.dispatch().await.expect("dispatch");

    // Writing the upper field must preserve the low bits already there.
    hw.get_node("REG_UPPER_MASK").expect("node").write(0xABCD).expect("write");
    let lower = hw.get_node("REG_LOWER_MASK").expect("node").read().expect("read");
    let upper = hw.get_node("REG_UPPER_MASK").expect("node").read().expect("read");
    hw.dispatch().await.expect("dispatch");

    assert_eq!(upper.value().expect("value"), 0xABCD);
    assert_eq!(lower.value().expect("value"), 0x1234);
}

#[tokio::test]
async fn small_block_roundtrip() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    let written: Vec<u32> = (0..256).collect();
    hw.get_node("SMALL_MEM")
        .expect("node")
        .write_block(written.clone())
        .expect("write");
    let read = hw.get_node("SMALL_MEM").expect("node").read_block(256).expect("read");
    hw.dispatch().await.expect("dispatch");
    assert_eq!(read.value().expect("value"), written);
}

#[tokio::test]
async fn large_block_spans_packets_and_window() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    let written: Vec<u32> = (0..3000).map(|i| i * 3 + 1).collect();
    hw.get_node("MEM")
        .expect("node")
        .write_block(written.clone())
        .expect("write");
    let read = hw.get_node("MEM").expect("node").read_block(3000).expect("read");
    hw.dispatch().await.expect("dispatch");
    assert_eq!(read.value().expect("value"), written);
}

#[tokio::test]
async fn block_offset_reads_the_tail() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    let written: Vec<u32> = (100..200).collect();
    hw.get_node("MEM")
        .expect("node")
        .write_block(written.clone())
        .expect("write");
    let tail = hw
        .get_node("MEM")
        .expect("node")
        .read_block_offset(10, 90)
        .expect("read");
    hw.dispatch().await.expect("dispatch");
    assert_eq!(tail.value().expect("value"), written[90..].to_vec());
}

#[tokio::test]
async fn fifo_holds_the_address_constant() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    hw.get_node("FIFO")
        .expect("node")
        .write_block(vec![1, 2, 3, 4])
        .expect("write");
    let read = hw.get_node("FIFO").expect("node").read_block(4).expect("read");
    hw.dispatch().await.expect("dispatch");
    // Four writes landed on the same cell, so four reads of that cell all
    // observe the last one.
    assert_eq!(read.value().expect("value"), vec![4, 4, 4, 4]);
}

#[tokio::test]
async fn queueing_time_permission_errors_are_immediate() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    let read_only = hw.get_node("REG_READ_ONLY").expect("node");
    assert!(matches!(
        read_only.write(1),
        Err(HalError::RegMap(
            ipbus_hal::RegMapError::WriteAccessDenied { .. }
        ))
    ));
    let write_only = hw.get_node("REG_WRITE_ONLY").expect("node");
    assert!(matches!(
        write_only.read(),
        Err(HalError::RegMap(
            ipbus_hal::RegMapError::ReadAccessDenied { .. }
        ))
    ));
    let fifo = hw.get_node("FIFO").expect("node");
    assert!(matches!(
        fifo.read_block(262_145),
        Err(HalError::RegMap(
            ipbus_hal::RegMapError::BulkTransferTooLarge { .. }
        ))
    ));
    let subsystem = hw.get_node("SUBSYSTEM1").expect("node");
    assert!(subsystem.read().is_err());
    // Nothing was queued, so the dispatch is a no-op.
    hw.dispatch().await.expect("dispatch");
}

#[tokio::test]
async fn empty_and_repeated_dispatches_are_noops() {
    let (handle, _dir, hw) = setup(DummyConfig::default()).await;
    hw.dispatch().await.expect("empty dispatch");
    assert_eq!(handle.control_packets(), 0);

    hw.get_node("REG").expect("node").write(7).expect("write");
    hw.dispatch().await.expect("dispatch");
    let after_first = handle.control_packets();
    assert!(after_first > 0);

    hw.dispatch().await.expect("repeat dispatch");
    hw.dispatch().await.expect("repeat dispatch");
    assert_eq!(handle.control_packets(), after_first);
}

#[tokio::test]
async fn lost_reply_is_recovered_through_a_status_probe() {
    let (handle, _dir, hw) = setup(DummyConfig::default()).await;

    // Warm the link so the negotiation probe is out of the way.
    hw.get_node("REG").expect("node").write(1).expect("write");
    hw.dispatch().await.expect("dispatch");
    let probes_before = handle.status_requests();

    handle.drop_next_replies(1);
    let read = hw.get_node("REG").expect("node").read().expect("read");
    hw.dispatch().await.expect("dispatch recovers");
    assert_eq!(read.value().expect("value"), 1);
    assert!(handle.status_requests() > probes_before);
    assert!(handle.resend_requests() >= 1);
}

#[tokio::test]
async fn lost_request_is_retransmitted_without_reexecution() {
    let (handle, _dir, hw) = setup(DummyConfig::default()).await;
    hw.get_node("REG").expect("node").write(5).expect("write");
    hw.dispatch().await.expect("dispatch");

    // Drop everything while the batch goes out, then restore the link
    // before the recovery probe fires.
    handle.set_drop_all(true);
    let add = hw.client().rmw_sum(0x1, 10);
    let dispatch = hw.dispatch();
    let restore = async {
        tokio::time::sleep(TEST_TIMEOUT / 2).await;
        handle.set_drop_all(false);
    };
    let (result, ()) = tokio::join!(dispatch, restore);
    result.expect("dispatch recovers");
    assert_eq!(add.value().expect("value"), 5);

    let read = hw.get_node("REG").expect("node").read().expect("read");
    hw.dispatch().await.expect("dispatch");
    // The RMW ran exactly once despite the retransmission.
    assert_eq!(read.value().expect("value"), 15);
}

#[tokio::test]
async fn dead_device_fails_the_whole_batch() {
    let (handle, _dir, hw) = setup(DummyConfig::default()).await;

    // Warm the link first so the failure exercises control recovery, not
    // negotiation.
    hw.get_node("REG").expect("node").write(1).expect("write");
    hw.dispatch().await.expect("dispatch");

    handle.set_drop_all(true);
    hw.set_timeout(Duration::from_millis(50));
    let word = hw.get_node("REG").expect("node").read().expect("read");
    let ack = hw.get_node("REG").expect("node").write(2).expect("write");
    let err = hw.dispatch().await.expect_err("transport must die");
    assert!(matches!(err, HalError::Udp(UdpError::Dead { .. })));
    assert!(!word.valid());
    assert!(!ack.valid());
    assert!(matches!(
        word.value(),
        Err(HalError::NonValidatedMemory(_))
    ));

    // The link stays dead for later dispatches.
    hw.get_node("REG").expect("node").read().expect("read");
    let err = hw.dispatch().await.expect_err("still dead");
    assert!(matches!(err, HalError::Udp(UdpError::Dead { .. })));
}

#[tokio::test]
async fn device_error_fails_only_its_own_transaction() {
    use ipbus_hal::{Client, NodeBuilder, Uri};
    use std::sync::Arc;

    let handle = DummyHardware::spawn(DummyConfig {
        bus_error_addr: Some(0x50),
        ..DummyConfig::default()
    })
    .await
    .expect("spawn dummy");

    let uri = Uri::parse(&format!("ipbusudp-2.0://{}", handle.addr())).expect("uri");
    let client = Client::from_uri("poisoned", uri).expect("client");
    client.set_timeout(TEST_TIMEOUT);
    let tree = Arc::new(
        NodeBuilder::root()
            .child(NodeBuilder::register("GOOD").address(0x40))
            .child(NodeBuilder::register("BAD").address(0x50))
            .build()
            .expect("tree"),
    );
    let hw = HwInterface::new(client, tree);

    hw.get_node("GOOD").expect("node").write(11).expect("write");
    let bad = hw.get_node("BAD").expect("node").read().expect("read");
    let good = hw.get_node("GOOD").expect("node").read().expect("read");
    hw.dispatch().await.expect("device errors are not fatal");

    assert!(!bad.valid());
    match bad.value() {
        Err(HalError::NonValidatedMemory(reason)) => {
            assert!(reason.contains("BusReadError"), "reason: {reason}");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(good.value().expect("value"), 11);
}

#[tokio::test]
async fn version_1_3_devices_work_through_the_same_engine() {
    use ipbus_hal::{Client, NodeBuilder, Uri};
    use std::sync::Arc;

    let handle = DummyHardware::spawn(DummyConfig {
        version: ipbus_hal::ProtocolVersion::V1_3,
        ..DummyConfig::default()
    })
    .await
    .expect("spawn dummy");

    let uri = Uri::parse(&format!("ipbusudp-1.3://{}", handle.addr())).expect("uri");
    let client = Client::from_uri("legacy", uri).expect("client");
    client.set_timeout(TEST_TIMEOUT);
    let tree = Arc::new(
        NodeBuilder::root()
            .child(NodeBuilder::register("REG").address(0x1))
            .child(NodeBuilder::block("MEM", 2048).address(0x1000))
            .build()
            .expect("tree"),
    );
    let hw = HwInterface::new(client, tree);

    hw.get_node("REG").expect("node").write(0x1313).expect("write");
    let word = hw.get_node("REG").expect("node").read().expect("read");
    let written: Vec<u32> = (0..1000).collect();
    hw.get_node("MEM")
        .expect("node")
        .write_block(written.clone())
        .expect("write");
    let block = hw.get_node("MEM").expect("node").read_block(1000).expect("read");
    hw.dispatch().await.expect("dispatch");

    assert_eq!(word.value().expect("value"), 0x1313);
    assert_eq!(block.value().expect("value"), written);
    // No status machinery on a 1.3 link.
    assert_eq!(handle.status_requests(), 0);
}

#[tokio::test]
async fn config_space_is_separate_from_memory() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    hw.client().write_config(0x0, vec![0x11, 0x22]);
    let config = hw.client().read_config(0x0, 2);
    let memory = hw.client().read(0x0);
    hw.dispatch().await.expect("dispatch");
    assert_eq!(config.value().expect("value"), vec![0x11, 0x22]);
    assert_eq!(memory.value().expect("value"), 0);
}

#[tokio::test]
async fn rmw_operations_observe_the_previous_value() {
    let (_handle, _dir, hw) = setup(DummyConfig::default()).await;
    hw.get_node("REG").expect("node").write(0x0F0F_0F0F).expect("write");
    let before_bits = hw.client().rmw_bits(0x1, 0xFFFF_0000, 0x0000_00F0);
    let before_sum = hw.client().rmw_sum(0x1, 0x10);
    let after = hw.get_node("REG").expect("node").read().expect("read");
    hw.dispatch().await.expect("dispatch");

    assert_eq!(before_bits.value().expect("value"), 0x0F0F_0F0F);
    assert_eq!(before_sum.value().expect("value"), 0x0F0F_00F0);
    assert_eq!(after.value().expect("value"), 0x0F0F_0100);
}
