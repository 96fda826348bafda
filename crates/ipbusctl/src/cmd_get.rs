use anyhow::Result;
use serde::Serialize;

use crate::common::{open_device, print_json};

#[derive(Debug, Serialize)]
struct GetOutput {
    node: String,
    value: String,
}

pub async fn run(connections: &str, device: &str, node: &str, json: bool) -> Result<()> {
    let hw = open_device(connections, device)?;
    let word = hw.get_node(node)?.read()?;
    hw.dispatch().await?;
    let value = word.value()?;
    if json {
        print_json(&GetOutput {
            node: node.to_string(),
            value: format!("0x{value:08x}"),
        })?;
    } else {
        println!("{node} = 0x{value:08x}");
    }
    Ok(())
}
