use anyhow::Result;
use ipbus_hal::{Mode, Permission, NOMASK};
use serde::Serialize;

use crate::common::{open_device, print_json};

#[derive(Debug, Serialize)]
struct NodeRow {
    path: String,
    address: String,
    mode: &'static str,
    size: u32,
    mask: String,
    permission: &'static str,
    tags: String,
    description: String,
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Single => "single",
        Mode::Incremental => "incremental",
        Mode::NonIncremental => "non-incremental",
        Mode::Hierarchical => "hierarchical",
    }
}

fn permission_name(permission: Permission) -> &'static str {
    match permission {
        Permission::Read => "r",
        Permission::Write => "w",
        Permission::ReadWrite => "rw",
    }
}

pub fn run(connections: &str, device: &str, pattern: Option<&str>, json: bool) -> Result<()> {
    let hw = open_device(connections, device)?;
    let paths = match pattern {
        Some(pattern) => hw.nodes_matching(pattern)?,
        None => hw.nodes(),
    };
    let mut rows = Vec::with_capacity(paths.len());
    for path in paths {
        let view = hw.get_node(&path)?;
        let node = view.node();
        rows.push(NodeRow {
            path,
            address: format!("0x{:08x}", node.address()),
            mode: mode_name(node.mode()),
            size: node.size(),
            mask: if node.mask() == NOMASK {
                String::new()
            } else {
                format!("0x{:08x}", node.mask())
            },
            permission: permission_name(node.permission()),
            tags: node.tags().to_string(),
            description: node.description().to_string(),
        });
    }
    if json {
        print_json(&rows)?;
    } else {
        for row in &rows {
            println!(
                "{:40} {} {:15} size={:<8} {:2} {}",
                row.path, row.address, row.mode, row.size, row.permission, row.mask
            );
        }
    }
    Ok(())
}
