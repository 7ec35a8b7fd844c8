use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerlink::config::{get_config_path, Config};
use peerlink::relay::{self, WebSocketRelay};
use peerlink::rendezvous::{Client, NodeHandle, RendezvousNode};
use peerlink::webrtc::WebRtcSessionFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Find peers through a relay, meet in groups, talk directly", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.peerlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        /// Address to listen on
        #[arg(long)]
        addr: Option<String>,
    },
    /// Start a node and read commands from stdin
    Start {
        /// Relay URL to connect to
        #[arg(long)]
        relay: Option<String>,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("peerlink=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    // Load config, creating the default file on first run
    let config_path = cli.config.unwrap_or_else(get_config_path);
    let config = Config::load_from(&config_path)?;

    match cli.command {
        Commands::Relay { addr } => {
            let addr = addr.unwrap_or(config.relay.bind_address);
            let addr = addr.parse().context("Invalid relay bind address")?;
            println!("Relay listening on ws://{}", addr);
            relay::server::run(addr).await?;
        }
        Commands::Start { relay, name } => {
            let url = relay.unwrap_or(config.relay.url.clone());
            let client = Client::new(name.or(config.node.name.clone()));

            // Connect to the relay before the node starts broadcasting
            let (relay, inbound) = WebSocketRelay::connect(&url, &client.id)
                .await
                .context("Failed to connect to relay")?;
            let sessions = WebRtcSessionFactory::new(config.webrtc.stun_servers.clone());

            println!("Client: {} ({})", client.name, client.id);
            println!("Relay: {}", url);
            println!("Type 'help' for commands");

            let node = RendezvousNode::new(
                client,
                config.node.clone(),
                Arc::new(relay),
                Arc::new(sessions),
            );
            let (handle, task) = node.spawn(inbound);

            repl(&handle).await?;

            // Closes every session before the task ends
            handle.shutdown().await;
            task.await?;
        }
    }

    Ok(())
}

async fn repl(node: &NodeHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        match command {
            "" => {}
            "help" => {
                println!("  name <name>            change display name");
                println!("  groups                 list visible groups");
                println!("  create <name> [private] create a group and print its token");
                println!("  join <token>           join a group by token");
                println!("  leave                  leave the current group");
                println!("  connect                open sessions to group members");
                println!("  disconnect             close all sessions");
                println!("  send <text>            message connected members");
                println!("  members | messages | status");
                println!("  quit");
            }
            "name" => {
                let client = node.set_name(arg).await?;
                println!("Name: {}", client.name);
            }
            "groups" => {
                let snapshot = node.snapshot().await?;
                if snapshot.groups.is_empty() {
                    println!("No groups visible");
                }
                for group in snapshot.groups {
                    let visibility = if group.is_public { "public" } else { "private" };
                    println!("  {} [{}] {:?} {}", group.name, visibility, group.status, group.id);
                }
            }
            "create" => {
                // `create <name> private` makes a token-only group
                let (name, is_public) = match arg.strip_suffix("private") {
                    Some(name) => (name.trim(), false),
                    None => (arg, true),
                };
                let token = node.create_group(name, is_public).await?;
                println!("Created '{}'. Token: {}", name, token);
            }
            "join" => match node.join_group(arg).await? {
                Some(group) => println!("Joined '{}'", group.name),
                None => println!("No group found for that token"),
            },
            "leave" => {
                node.leave_group().await?;
                println!("Left group");
            }
            "connect" => {
                let offered = node.connect().await?;
                println!("Offering sessions to {} peers", offered);
            }
            "disconnect" => {
                node.disconnect().await?;
                println!("Disconnected");
            }
            "send" => {
                let delivered = node.send(arg).await?;
                println!("Delivered to {} peers", delivered);
            }
            "members" => {
                for member in node.snapshot().await?.members {
                    println!("  {} ({})", member.name, member.id);
                }
            }
            "messages" => {
                for message in node.snapshot().await?.messages {
                    println!("  [{}] {}", message.name, message.text);
                }
            }
            "status" => {
                let snapshot = node.snapshot().await?;
                let client = &snapshot.client;
                println!("Client: {} ({}) {}", client.name, client.id, client.status);
                match snapshot.group {
                    Some(group) => println!("Group: {} {:?}", group.name, group.status),
                    None => println!("Group: none"),
                }
                println!("Peers: {}", snapshot.peers);
                println!("Members: {}", snapshot.members.len());
            }
            "quit" | "exit" => break,
            other => println!("Unknown command: {}", other),
        }
    }

    Ok(())
}
