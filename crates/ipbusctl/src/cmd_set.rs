use anyhow::Result;
use serde::Serialize;

use crate::common::{open_device, parse_word, print_json};

#[derive(Debug, Serialize)]
struct SetOutput {
    node: String,
    value: String,
}

pub async fn run(
    connections: &str,
    device: &str,
    node: &str,
    value: &str,
    json: bool,
) -> Result<()> {
    let hw = open_device(connections, device)?;
    let value = parse_word(value)?;
    hw.get_node(node)?.write(value)?;
    hw.dispatch().await?;
    if json {
        print_json(&SetOutput {
            node: node.to_string(),
            value: format!("0x{value:08x}"),
        })?;
    } else {
        println!("{node} <- 0x{value:08x}");
    }
    Ok(())
}
