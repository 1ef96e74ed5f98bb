use clap::Parser;
use std::path::PathBuf;

/// Token-budgeting reverse proxy for a hosted LLM API.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to the configuration file (created with defaults if missing)
    #[arg(short, long, default_value = "config.json", env = "TURNSTILE_CONFIG")]
    config: PathBuf,

    /// Host to bind to (overrides configuration)
    #[arg(long, env = "TURNSTILE_HOST")]
    host: Option<String>,

    /// Port to bind to (overrides configuration)
    #[arg(short, long, env = "TURNSTILE_PORT")]
    port: Option<u16>,

    /// Log level (overrides configuration)
    #[arg(long, env = "TURNSTILE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let serve_args = turnstile::serve::ServeArgs {
        config: args.config,
        host: args.host,
        port: args.port,
        log_level: args.log_level,
    };

    if let Err(e) = turnstile::serve::run(serve_args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
