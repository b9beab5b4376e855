/*
 * replica is a raftkv replica server. It takes its own four-hex-digit ID and
 * the IDs of its peers on the command line, joins the cluster over the
 * datagram transport, and serves client get/put requests until killed. The
 * RAFTKV_LOG_LEVEL environment variable selects the log verbosity.
 */

#![warn(clippy::all)]

use raftkv::error::Result;
use raftkv::raft::{self, ReplicaId, Server};

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A raftkv replica, serving a replicated key/value store")
        .arg(
            clap::Arg::new("id")
                .required(true)
                .help("The replica's four-hex-digit ID, doubling as its endpoint name"),
        )
        .arg(
            clap::Arg::new("peers")
                .num_args(0..)
                .help("The four-hex-digit IDs of all other replicas"),
        )
        .get_matches();

    let id: ReplicaId = args.get_one::<String>("id").expect("id is required").parse()?;
    let peers: Vec<ReplicaId> = args
        .get_many::<String>("peers")
        .unwrap_or_default()
        .map(|peer| peer.parse())
        .collect::<Result<_>>()?;

    let level = std::env::var("RAFTKV_LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if level != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("raftkv");
    }
    simplelog::SimpleLogger::init(level, logconfig.build())?;

    let transport = raft::Udp::new(id, &peers)?;
    Server::new(id, peers.into_iter().collect(), Box::new(transport), raft::Options::default())?
        .serve()
}
