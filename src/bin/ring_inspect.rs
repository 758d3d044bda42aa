//! Print partition placement for a node list
//!
//! Shows, for each partition key, the ordered replica set the hash ring
//! assigns and the replication group that serves it.

use chronoraft::cluster::{ClusterTopology, PartitionKey};
use chronoraft::config::DEFAULT_NODE;
use chronoraft::telemetry;

use anyhow::Context;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster nodes as ip:port, comma separated
    #[arg(long, env = "CHRONORAFT_NODES", value_delimiter = ',', default_value = DEFAULT_NODE)]
    nodes: Vec<String>,

    /// Replication factor
    #[arg(long, env = "CHRONORAFT_REPLICATION", default_value = "1")]
    replication: usize,

    /// Virtual nodes per physical node
    #[arg(long, env = "CHRONORAFT_VIRTUAL_NODES", default_value = "2")]
    virtual_nodes: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// List every data group instead of resolving keys
    #[arg(long)]
    groups: bool,

    /// Series paths or storage groups to place
    keys: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_for_component("ring_inspect", &args.log_level)?;

    let topology = ClusterTopology::new(&args.nodes, args.replication, args.virtual_nodes)
        .context("invalid cluster topology")?;
    info!(
        nodes = topology.nodes().len(),
        replication = topology.replication(),
        virtual_nodes = args.virtual_nodes,
        "Built hash ring"
    );

    if args.groups || args.keys.is_empty() {
        for route in topology.data_groups()? {
            println!("{}\t{}", route.group, route.replicas.join(","));
        }
        return Ok(());
    }

    for key in &args.keys {
        let key = PartitionKey::for_path(key);
        let route = topology
            .route(&key)
            .with_context(|| format!("cannot place {}", key))?;
        println!("{}\t{}\t{}", key, route.group, route.replicas.join(","));
    }
    Ok(())
}
