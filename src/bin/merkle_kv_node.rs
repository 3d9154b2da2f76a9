//! # merkle_kv_node
//!
//! Thin CLI entry point: parse `--config`, load a [`NodeConfig`], start a
//! [`Node`], and block forever. All real behavior lives in the library
//! crate; this binary only wires `clap` and the Tokio runtime around it,
//! the same division of labor the teacher's `main.rs` used between
//! argument parsing and `Server::run`.

use clap::Parser;
use merkle_kv::{Node, NodeConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "merkle_kv_node", about = "A MerkleKV MQTT-replicated node")]
struct Args {
    /// Path to the node's TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = NodeConfig::load(&args.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Held for the process lifetime: Node's background tasks (event
        // loop polling, replication, anti-entropy, queue sweeps) run off
        // this Arc's clones, but nothing besides `ctrl_c` needs to touch
        // `node` again before shutdown.
        let node = Node::start(config).await?;
        log::info!("merkle_kv node started");
        tokio::signal::ctrl_c().await?;
        log::info!("shutdown signal received, disconnecting");
        node.lifecycle()
            .submit(merkle_kv::lifecycle::AppState::Terminating)
            .await;
        Ok(())
    })
}
