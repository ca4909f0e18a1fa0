//! MeshKV node binary
//!
//! Peers come from `--nodes` or the `NODES` environment variable as a
//! comma-separated `host:port` list; the listening port is the optional
//! positional argument.

use clap::{Parser, ValueEnum};
use meshkv::{ring::parse_node_list, MeshKvServer, NodeAddr, ReadMode, Result, RoutingStrategy, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a MeshKV storage node")]
struct Args {
    /// Port to listen on (all interfaces)
    #[arg(default_value_t = 8081)]
    port: u16,

    /// Comma-separated peer list: host:port,host:port,...
    #[arg(long, env = "NODES", default_value = "")]
    nodes: String,

    /// Host part of this node's ring identity
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Key-to-node matching rule
    #[arg(long, value_enum, default_value_t = Routing::FirstMinimal)]
    routing: Routing,

    /// Assemble requests until newline instead of taking a single read
    #[arg(long)]
    read_until_newline: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Routing {
    FirstMinimal,
    Successor,
}

impl From<Routing> for RoutingStrategy {
    fn from(routing: Routing) -> Self {
        match routing {
            Routing::FirstMinimal => RoutingStrategy::FirstMinimal,
            Routing::Successor => RoutingStrategy::Successor,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let (peers, invalid) = parse_node_list(&args.nodes);
    for entry in invalid {
        warn!(%entry, "ignoring invalid node entry");
    }
    if peers.is_empty() {
        warn!("no peers configured, running as a single node");
    }

    let config = ServerConfig {
        listen: SocketAddr::from(([0, 0, 0, 0], args.port)),
        node: NodeAddr::new(args.host, args.port),
        peers,
        routing: args.routing.into(),
        read_mode: if args.read_until_newline {
            ReadMode::UntilNewline
        } else {
            ReadMode::SingleRead
        },
        ..ServerConfig::default()
    };

    let server = match MeshKvServer::bind(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(port = args.port, error = %e, "failed to start server");
            return Err(e);
        }
    };

    // Setup graceful shutdown on SIGINT (Ctrl+C)
    let server_clone = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = ?e, "failed to listen for ctrl-c");
            return;
        }
        info!("received ctrl-c, initiating graceful shutdown");
        if let Err(e) = server_clone.shutdown() {
            warn!(error = %e, "failed to initiate shutdown");
        }
    });

    server.run().await?;
    info!("server stopped");
    Ok(())
}
