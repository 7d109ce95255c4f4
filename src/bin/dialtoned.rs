// ABOUTME: Server binary — loads configuration, wires up process-wide services, and runs the listener
// ABOUTME: Exit codes follow the configuration table: 0 on clean shutdown, nonzero on bind/config failure

use clap::Parser;
use dialtone::auth::StaticCredentialChecker;
use dialtone::config::DialtoneConfig;
use dialtone::dispatcher::TokenHandlerRegistry;
use dialtone::keyword::KeywordRegistry;
use dialtone::listener::Listener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dialtoned", about = "P3 wire-protocol server")]
struct Cli {
    /// Path to a Java-properties-formatted configuration file.
    #[arg(long, env = "DIALTONE_CONFIG")]
    config: Option<PathBuf>,

    /// Accept ephemeral guest logins when the supplied credentials don't match.
    #[arg(long)]
    allow_guests: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DialtoneConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            // Tracing isn't initialized yet if the config itself controls
            // verbosity, so a malformed file is reported on stderr directly.
            eprintln!("dialtoned: failed to load configuration: {err}");
            return ExitCode::from(1);
        }
    };

    init_tracing(config.verbose);

    let credentials = Arc::new(StaticCredentialChecker::parse(&config.auth_users));
    info!(users = credentials.user_count(), "loaded static credential list");

    let keywords = Arc::new(KeywordRegistry::new());
    let delegated = Arc::new(TokenHandlerRegistry::new());

    let listener = match Listener::bind(config, keywords, credentials, delegated, cli.allow_guests).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind listener");
            return ExitCode::from(1);
        }
    };

    listener
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to install ctrl-c handler; running without graceful shutdown");
                std::future::pending::<()>().await;
            }
        })
        .await;

    ExitCode::SUCCESS
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
