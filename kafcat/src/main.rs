//! Consume a Kafka topic across partitions and print it to stdout.
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kafcat::config::{Args, KafkaConfig};
use kafcat::error::{CliError, EXIT_USAGE};
use kafcat::kafka::KafkaBrokerClient;
use kafcat_common::session::{list_topics, run_session};
use kafcat_common::shutdown::ShutdownCoordinator;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_USAGE } else { 0 };
            if let Err(print_err) = err.print() {
                eprintln!("failed to print usage: {}", print_err);
            }
            return ExitCode::from(code);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            eprintln!();
            if err.is_usage() {
                eprintln!("Available command line options:");
                eprintln!("{}", Args::command().render_help());
            }
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let peers = args.peers()?;
    // Usage problems are reported before connecting to anything.
    let session = if args.list_topics {
        None
    } else {
        Some(args.session_config()?)
    };

    let kafka_config = KafkaConfig::init_from_env()?;
    let client = KafkaBrokerClient::new(&peers, &kafka_config, args.verbose)?;

    let Some(config) = session else {
        list_topics(&client, tokio::io::stdout()).await?;
        return Ok(());
    };

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.listen_for_signals();

    let result = run_session(&client, &config, &shutdown, tokio::io::stdout()).await;
    signals.abort();

    let summary = result?;
    info!(
        topic = %config.topic,
        written = summary.output.written,
        filtered = summary.output.filtered,
        "done consuming"
    );
    Ok(())
}
