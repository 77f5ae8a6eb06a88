//! tally-client: observer and feed host for the chat-tally coordinator.
//!
//! ## Subcommands
//!
//! - `global`, `session`, `sessions`: query coordinator state (JSON on stdout)
//! - `evict`, `foreground`: coordinator housekeeping
//! - `watch`: print one line per coordinator update until interrupted
//! - `feed`: host a monitor fed from stdin, forwarding to the coordinator
//! - `health`: coordinator liveness

mod coordinator_client;
mod feed_host;
mod logging;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use coordinator_client::{ClientError, CoordinatorClient};
use feed_host::{forward_messages, FeedHost};
use tally_core::{load_config, ChannelOutbox, TallyConfig};

#[derive(Parser)]
#[command(name = "tally-client")]
#[command(about = "Chat participant tally client")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.chat-tally/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Union of unique participants across active sessions
    Global,

    /// State of one session
    Session {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Every session the coordinator knows about
    Sessions,

    /// Forget a session entirely
    Evict {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Choose the session the badge reflects
    Foreground {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Print coordinator updates as they happen
    Watch,

    /// Host a monitor whose feed and commands arrive on stdin
    Feed {
        /// Session this monitor reports as
        #[arg(long)]
        session: String,
    },

    /// Check that the coordinator is up
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let config = match load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to load config; using defaults");
            TallyConfig::default()
        }
    };

    let client = match CoordinatorClient::from_config(&config) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Global => client.global().and_then(|global| print_json(&global)),
        Commands::Session { session_id } => {
            client.session(&session_id).and_then(|session| match session {
                Some(session) => print_json(&session),
                None => {
                    eprintln!("no session {}", session_id);
                    std::process::exit(2);
                }
            })
        }
        Commands::Sessions => client.sessions().and_then(|sessions| print_json(&sessions)),
        Commands::Evict { session_id } => client
            .evict(&session_id)
            .and_then(|evicted| print_json(&serde_json::json!({ "evicted": evicted }))),
        Commands::Foreground { session_id } => client.set_foreground(&session_id),
        Commands::Watch => watch(&client),
        Commands::Health => client.health().and_then(|health| print_json(&health)),
        Commands::Feed { session } => {
            run_feed(&session, &config, client);
            Ok(())
        }
    };

    if let Err(err) = result {
        tracing::warn!(error = %err, "tally-client command failed");
        match err {
            ClientError::Unreachable { .. } => eprintln!("could not reach coordinator"),
            other => eprintln!("error: {}", other),
        }
        std::process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ClientError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| ClientError::Transport(format!("Failed to render output: {}", err)))?;
    println!("{}", rendered);
    Ok(())
}

fn watch(client: &CoordinatorClient) -> Result<(), ClientError> {
    for update in client.subscribe()? {
        let update = update?;
        let count = update
            .session
            .as_ref()
            .map(|session| session.user_count.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\tusers={}\tglobal={}\tactive={}",
            update.session_id,
            update.cause,
            count,
            update.global.total_unique_identities,
            update.global.active_session_count
        );
    }
    tracing::info!("Coordinator closed the subscription");
    Ok(())
}

/// The feed keeps running when the coordinator is down; sends are dropped
/// until it comes back.
fn run_feed(session_id: &str, config: &TallyConfig, client: CoordinatorClient) {
    let host = match FeedHost::from_config(session_id, config) {
        Ok(host) => host,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {}", err);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let (outbox, messages) = ChannelOutbox::channel();
        let forwarder = tokio::spawn(forward_messages(client, messages));

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        host.run(stdin, &mut stdout, Arc::new(outbox)).await;

        if let Err(err) = forwarder.await {
            tracing::warn!(error = %err, "Forwarder task ended abnormally");
        }
    });
}
