use cellaserv::config::settings::DEFAULT_SETTINGS_FILE;
use cellaserv::{BrokerConfig, BrokerServer, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Parser, Debug)]
#[command(name = "cellaserv")]
#[command(version, about = "Request/reply and publish/subscribe message broker")]
struct Args {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Logger verbosity: 0, 1, 2 or error, warn, info, debug, trace
    #[arg(short, long)]
    log_level: Option<String>,

    /// Root directory of the event logs
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Capture every message in this pcap file
    #[arg(long)]
    dump_file: Option<PathBuf>,

    /// Settings file
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BrokerConfig::load(Some(&args.config))?;
    let mut invalid_level = None;
    if let Some(level) = &args.log_level {
        if let Err(e) = config.set_verbosity_from_str(level) {
            invalid_level = Some(e);
        }
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(log_root) = args.log_root {
        config.log_root = log_root;
    }
    config.log_file = args.log_file.or(config.log_file);
    config.dump_file = args.dump_file.or(config.dump_file);

    init_tracing(&config);
    if let Some(e) = invalid_level {
        warn!("[Config] {}", e);
    }

    info!("Starting cellaserv {} on {}", cellaserv::VERSION, config.listen_addr());
    info!("Log root: {}", config.log_root.display());
    if let Some(dump) = &config.dump_file {
        info!("Dump file: {}", dump.display());
    }

    let server = BrokerServer::bind(config).await?;

    // Spawn the server task
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = server_handle => {
            info!("Server task completed");
        }
    }

    info!("cellaserv shut down");
    Ok(())
}

fn init_tracing(config: &BrokerConfig) {
    let builder = tracing_subscriber::fmt().with_max_level(config.verbosity.as_level());

    let Some(path) = &config.log_file else {
        builder.with_writer(BoxMakeWriter::new(std::io::stderr)).init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => builder
            .with_ansi(false)
            .with_writer(BoxMakeWriter::new(Mutex::new(file)))
            .init(),
        Err(e) => {
            builder.with_writer(BoxMakeWriter::new(std::io::stderr)).init();
            warn!(
                "Could not open log file {}: {}, falling back on stderr",
                path.display(),
                e
            );
        }
    }
}
