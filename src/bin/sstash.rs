//! sstash server launcher.
//!
//! ```text
//! sstash <primary_port> <read_only_port> [master_ip master_port]
//! ```
//!
//! With no master the node is a leader; with one it follows that leader
//! and serves reads from its own ports. Exit codes: 0 normal, 1 argument
//! error, 2 bind failure.

use anyhow::Context;
use sstash::{Server, ServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!(
        r#"
sstash - An In-Memory Key-Value Store with Stashes

USAGE:
    sstash <primary_port> <read_only_port> [master_ip master_port]

ARGS:
    <primary_port>      Port of the read-write listener
    <read_only_port>    Port of the read-only listener
    [master_ip master_port]
                        Leader to follow; omit to run as a leader

OPTIONS:
    -v, --version       Print version information
        --help          Print this help message

ENVIRONMENT:
    SSTASH_DATA_DIR     Data directory for snapshots and mapped pools
                        (default: the working directory)

EXAMPLES:
    sstash 3000 3001                  # leader
    sstash 4000 4001 127.0.0.1 3000   # follower of :3000
"#
    );
}

/// Parses argv into a config. Exits with code 1 on argument errors.
fn config_from_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help") {
        print_help();
        std::process::exit(0);
    }
    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("sstash version {}", sstash::VERSION);
        std::process::exit(0);
    }

    if args.len() != 2 && args.len() != 4 {
        eprintln!("Error: expected 2 or 4 arguments, got {}", args.len());
        print_help();
        std::process::exit(1);
    }

    let parse_port = |arg: &str, what: &str| -> u16 {
        arg.parse().unwrap_or_else(|_| {
            eprintln!("Error: invalid {}: {}", what, arg);
            std::process::exit(1);
        })
    };

    let primary_port = parse_port(&args[0], "primary_port");
    let read_only_port = parse_port(&args[1], "read_only_port");
    if primary_port == read_only_port {
        eprintln!("Error: primary and read-only ports must differ");
        std::process::exit(1);
    }

    let mut config = ServerConfig::new(primary_port, read_only_port);
    if args.len() == 4 {
        let master_port = parse_port(&args[3], "master_port");
        config = config.with_master(args[2].clone(), master_port);
    }
    config
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
            _            _
   ___  ___| |_ __ _ ___| |__
  / __|/ __| __/ _` / __| '_ \
  \__ \\__ \ || (_| \__ \ | | |
  |___/|___/\__\__,_|___/_| |_|

sstash v{} - In-Memory Key-Value Store
──────────────────────────────────────
Primary (read-write) port: {}
Read-only port:            {}
Role:                      {}

Use Ctrl+C to shut down gracefully.
"#,
        sstash::VERSION,
        config.primary_port,
        config.read_only_port,
        match &config.master {
            Some((ip, port)) => format!("follower of {}:{}", ip, port),
            None => "leader".to_string(),
        }
    );
}

#[tokio::main]
async fn main() {
    let config = config_from_args();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    print_banner(&config);

    // Anything that fails past argument parsing is a bind/startup failure.
    if let Err(e) = serve(config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = Server::bind(config)
        .await
        .context("failed to start the server")?;

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    server.run(shutdown).await;
    Ok(())
}
