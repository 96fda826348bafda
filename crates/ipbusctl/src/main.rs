use std::net::SocketAddr;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ipbusctl::cmd_dummy;
use ipbusctl::cmd_get;
use ipbusctl::cmd_nodes;
use ipbusctl::cmd_selftest;
use ipbusctl::cmd_set;

#[derive(Parser, Debug)]
#[command(name = "ipbusctl", version, about = "Hardware access CLI")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Output JSON where applicable
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List nodes of a device's address table
    Nodes {
        /// Connection file URI (file://...)
        #[arg(long)]
        connections: String,
        /// Device id within the connection file
        #[arg(long)]
        device: String,
        /// Only list paths matching this regular expression
        #[arg(long)]
        regex: Option<String>,
    },
    /// Read a register through its node path
    Get {
        #[arg(long)]
        connections: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        node: String,
    },
    /// Write a register through its node path
    Set {
        #[arg(long)]
        connections: String,
        #[arg(long)]
        device: String,
        #[arg(long)]
        node: String,
        #[arg(long)]
        value: String,
    },
    /// Run a software device speaking the control protocol
    Dummy {
        #[arg(long, default_value = "127.0.0.1:50001")]
        bind: SocketAddr,
        #[arg(long, default_value_t = 1500)]
        mtu: u32,
        #[arg(long, default_value_t = 4)]
        buffers: u32,
    },
    /// Run end-to-end checks against a device; exits non-zero on failure
    Selftest {
        #[arg(long)]
        connections: String,
        #[arg(long)]
        device: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { verbose, json, cmd } = Cli::parse();

    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()),
        ))
        .with_target(false)
        .init();

    match cmd {
        Cmd::Nodes {
            connections,
            device,
            regex,
        } => cmd_nodes::run(&connections, &device, regex.as_deref(), json)?,
        Cmd::Get {
            connections,
            device,
            node,
        } => cmd_get::run(&connections, &device, &node, json).await?,
        Cmd::Set {
            connections,
            device,
            node,
            value,
        } => cmd_set::run(&connections, &device, &node, &value, json).await?,
        Cmd::Dummy { bind, mtu, buffers } => cmd_dummy::run(bind, mtu, buffers).await?,
        Cmd::Selftest {
            connections,
            device,
        } => cmd_selftest::run(&connections, &device).await?,
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nodes_with_regex() {
        let cli = Cli::parse_from([
            "ipbusctl",
            "nodes",
            "--connections",
            "file://c.xml",
            "--device",
            "board0",
            "--regex",
            "^DAQ",
        ]);
        match cli.cmd {
            Cmd::Nodes { regex, device, .. } => {
                assert_eq!(regex.as_deref(), Some("^DAQ"));
                assert_eq!(device, "board0");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn parse_dummy_defaults() {
        let cli = Cli::parse_from(["ipbusctl", "dummy"]);
        match cli.cmd {
            Cmd::Dummy { bind, mtu, buffers } => {
                assert_eq!(bind, "127.0.0.1:50001".parse().unwrap());
                assert_eq!(mtu, 1500);
                assert_eq!(buffers, 4);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn parse_set_value() {
        let cli = Cli::parse_from([
            "ipbusctl",
            "set",
            "--connections",
            "file://c.xml",
            "--device",
            "board0",
            "--node",
            "REG",
            "--value",
            "0xABCD",
        ]);
        match cli.cmd {
            Cmd::Set { node, value, .. } => {
                assert_eq!(node, "REG");
                assert_eq!(value, "0xABCD");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
