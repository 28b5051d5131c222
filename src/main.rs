//! Federated WebSocket Chat Node - Entry Point
//!
//! Starts the node router, opens the initial room, optionally federates
//! with a parent node, and accepts connections.

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatnode::{connect_to_parent, handle_connection, Node, NodeCommand, NodeId};

#[derive(Parser, Debug)]
#[command(name = "chatnode")]
#[command(about = "Federated WebSocket chat node", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Address of a parent node to federate with (host:port)
    #[arg(short, long)]
    parent: Option<String>,

    /// Display name of this node
    #[arg(short, long, default_value = "server")]
    name: String,

    /// Name of the initial room (defaults to `<name>_main`)
    #[arg(short, long)]
    room: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to control log level, e.g. RUST_LOG=chatnode=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatnode=info")),
        )
        .init();

    let args = Args::parse();

    // Start the node router actor
    let (node, node_tx) = Node::new(NodeId::new(), args.name.clone());
    tokio::spawn(node.run());

    // Open the initial room
    let initial = args.room.unwrap_or_else(|| format!("{}_main", args.name));
    let (tx, rx) = oneshot::channel();
    node_tx
        .send(NodeCommand::OpenRoom { name: initial.clone(), reply: tx })
        .await?;
    rx.await?;
    info!(room = %initial, "initial room open");

    // Federate with the parent, if one was given
    if let Some(parent) = &args.parent {
        connect_to_parent(parent, node_tx.clone()).await?;
        info!(parent = %parent, "federated with parent");
    }

    let listener = TcpListener::bind(&args.addr).await?;
    info!("chat node listening on {}", args.addr);

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("new connection from {}", addr);
                let node_tx = node_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, node_tx).await {
                        error!("connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}
