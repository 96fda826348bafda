//! Spin up the in-process dummy hardware and run a few batched
//! transactions against it through the full stack.
//!
//! ```sh
//! cargo run -p ipbus-hal --example dummy_roundtrip
//! ```

use std::sync::Arc;

use ipbus_hal::{Client, HwInterface, NodeBuilder, Uri};
use tl_udp::{DummyConfig, DummyHardware};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        )
        .init();

    let device = DummyHardware::spawn(DummyConfig::default()).await?;
    println!("dummy hardware on {}", device.addr());

    let tree = Arc::new(
        NodeBuilder::root()
            .child(NodeBuilder::register("CTRL").address(0x1))
            .child(NodeBuilder::register("SCALER").address(0x2).mask(0x0000_FFFF))
            .child(NodeBuilder::block("BUF", 1024).address(0x1000))
            .build()?,
    );
    let uri = Uri::parse(&format!("ipbusudp-2.0://{}", device.addr()))?;
    let hw = HwInterface::new(Client::from_uri("demo", uri)?, tree);

    // Queue a mixed batch, then flush it with a single dispatch.
    hw.get_node("CTRL")?.write(0xCAFE_F00D)?;
    hw.get_node("SCALER")?.write(0x1234)?;
    let ctrl = hw.get_node("CTRL")?.read()?;
    let scaler = hw.get_node("SCALER")?.read()?;
    hw.get_node("BUF")?.write_block((0..1024).collect())?;
    let buf = hw.get_node("BUF")?.read_block_all()?;
    hw.dispatch().await?;

    println!("CTRL   = 0x{:08x}", ctrl.value()?);
    println!("SCALER = 0x{:04x} (masked field)", scaler.value()?);
    println!("BUF[1023] = {:?}", buf.get(1023)?);
    Ok(())
}
