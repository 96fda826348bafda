use std::net::SocketAddr;

use anyhow::{Context, Result};
use tl_udp::{DummyConfig, DummyHardware};
use tracing::info;

pub async fn run(bind: SocketAddr, mtu: u32, buffers: u32) -> Result<()> {
    let handle = DummyHardware::spawn_on(
        bind,
        DummyConfig {
            mtu,
            buffers,
            ..DummyConfig::default()
        },
    )
    .await
    .with_context(|| format!("bind dummy hardware on {bind}"))?;
    info!(addr = %handle.addr(), mtu, buffers, "dummy hardware running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!(
        control_packets = handle.control_packets(),
        status_requests = handle.status_requests(),
        "dummy hardware stopping"
    );
    Ok(())
}
