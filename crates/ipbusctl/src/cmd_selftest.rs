//! End-to-end checks against a live device using the standard test
//! address table (REG, REG_UPPER_MASK/REG_LOWER_MASK, SMALL_MEM, FIFO).

use anyhow::{bail, Result};
use ipbus_hal::HwInterface;
use tracing::info;

use crate::common::open_device;

struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn new() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    fn check(&mut self, name: &str, ok: bool, detail: String) {
        if ok {
            info!(check = name, "ok");
        } else {
            self.failures.push(format!("{name}: {detail}"));
        }
    }
}

pub async fn run(connections: &str, device: &str) -> Result<()> {
    let hw = open_device(connections, device)?;
    let mut checks = Checks::new();

    register_roundtrip(&hw, &mut checks).await?;
    masked_fields(&hw, &mut checks).await?;
    block_roundtrip(&hw, &mut checks).await?;
    fifo_port(&hw, &mut checks).await?;
    // Dispatching with nothing queued must be a no-op.
    hw.dispatch().await?;

    if checks.failures.is_empty() {
        info!("self-test passed");
        Ok(())
    } else {
        for failure in &checks.failures {
            eprintln!("FAILED {failure}");
        }
        bail!("{} self-test check(s) failed", checks.failures.len());
    }
}

async fn register_roundtrip(hw: &HwInterface, checks: &mut Checks) -> Result<()> {
    hw.get_node("REG")?.write(0xDEAD_BEEF)?;
    let read = hw.get_node("REG")?.read()?;
    hw.dispatch().await?;
    let value = read.value()?;
    checks.check(
        "register round trip",
        value == 0xDEAD_BEEF,
        format!("read 0x{value:08x}, wrote 0xdeadbeef"),
    );
    Ok(())
}

async fn masked_fields(hw: &HwInterface, checks: &mut Checks) -> Result<()> {
    hw.get_node("REG_LOWER_MASK")?.write(0x1234)?;
    hw.get_node("REG_UPPER_MASK")?.write(0xABCD)?;
    let lower = hw.get_node("REG_LOWER_MASK")?.read()?;
    let upper = hw.get_node("REG_UPPER_MASK")?.read()?;
    hw.dispatch().await?;
    checks.check(
        "masked write preserves the other field",
        lower.value()? == 0x1234 && upper.value()? == 0xABCD,
        format!(
            "lower 0x{:04x}, upper 0x{:04x}",
            lower.value()?,
            upper.value()?
        ),
    );
    Ok(())
}

async fn block_roundtrip(hw: &HwInterface, checks: &mut Checks) -> Result<()> {
    let written: Vec<u32> = (0..256).collect();
    hw.get_node("SMALL_MEM")?.write_block(written.clone())?;
    let read = hw.get_node("SMALL_MEM")?.read_block(256)?;
    hw.dispatch().await?;
    checks.check(
        "block round trip",
        read.value()? == written,
        "read data differs from written data".to_string(),
    );
    Ok(())
}

async fn fifo_port(hw: &HwInterface, checks: &mut Checks) -> Result<()> {
    hw.get_node("FIFO")?.write_block(vec![1, 2, 3, 4])?;
    let read = hw.get_node("FIFO")?.read_block(4)?;
    hw.dispatch().await?;
    let len = read.len()?;
    checks.check(
        "fifo port access",
        len == 4,
        format!("expected 4 words from the port, got {len}"),
    );
    Ok(())
}
