use anyhow::Context;
use clap::Parser;
use mongo_capture::checkpoint::CheckpointManager;
use mongo_capture::mongo::MongoSource;
use mongo_capture::output::StdoutSink;
use mongo_capture::{Catalog, Config, Replicator, State};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "mongo-capture")]
#[command(about = "MongoDB change-data-capture connector", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(long, value_name = "FILE", help = "Catalog of streams to sync")]
    catalog: PathBuf,

    #[arg(short, long, value_name = "FILE", help = "State to resume from")]
    state: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting mongo-capture");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        mongodb_host = %config.mongodb.host,
        mongodb_port = %config.mongodb.port,
        replica_set = ?config.mongodb.replica_set,
        update_bookmark_period = config.replication.update_bookmark_period,
        max_update_buffer_length = config.replication.max_update_buffer_length,
        state_file = ?config.replication.state_file,
        "Configuration summary"
    );

    let catalog = Catalog::from_file(&args.catalog)
        .await
        .with_context(|| format!("failed to load catalog from {:?}", args.catalog))?;
    let mut state = load_state(&args, &config).await?;

    let source = MongoSource::connect(&config)
        .await
        .context("failed to connect to MongoDB")?;
    let mut replicator = Replicator::new(config.replication.clone(), source, StdoutSink::new());

    if let Err(e) = replicator.run(&catalog, &mut state).await {
        error!(error = %e, configuration = e.is_configuration(), "Sync failed");
        return Err(e.into());
    }

    info!(rows = replicator.stats().total_rows(), "Sync finished");
    Ok(())
}

/// `--state` wins over the configured state file; neither means a fresh run.
async fn load_state(args: &Args, config: &Config) -> anyhow::Result<State> {
    let path = match (&args.state, &config.replication.state_file) {
        (Some(path), _) => path,
        (None, Some(path)) => path,
        (None, None) => return Ok(State::new()),
    };
    let state = CheckpointManager::new(path)
        .load()
        .await
        .with_context(|| format!("failed to load state from {:?}", path))?;
    Ok(state.unwrap_or_default())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("mongo_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mongo_capture=info,warn"))
    };

    // stdout carries the message stream.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
