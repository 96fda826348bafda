use anyhow::{Context, Result};
use ipbus_hal::{ConnectionManager, HwInterface};
use serde::Serialize;

/// Open the device named in the connection file.
pub fn open_device(connections: &str, device: &str) -> Result<HwInterface> {
    let manager = ConnectionManager::from_uri(connections)
        .with_context(|| format!("load connection file {connections}"))?;
    manager
        .get_device(device)
        .with_context(|| format!("build device {device}"))
}

/// Parse a register value, accepting hex with an `0x` prefix.
pub fn parse_word(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.with_context(|| format!("parse value {text:?}"))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialise JSON output")?;
    println!("{text}");
    Ok(())
}
