//! Outflow CLI binary entry point.

use outflow::cli::replay::{exit_code, handle_config, handle_replay, load_config};
use outflow::cli::{Cli, Commands};
use outflow::run::RunStatus;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("OUTFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Replay(args) => handle_replay(args, config).await,
        Commands::Config => handle_config(&config).map(|()| RunStatus::Success),
    };

    if let Err(e) = &result {
        eprintln!("Error: {e}");
    }
    let code = exit_code(&result);
    if code != 0 {
        std::process::exit(code);
    }
}
