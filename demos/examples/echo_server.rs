use clap::Parser;
use log::info;
use serde_json::Value;
use std::{io::Write, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use portico_bootstrap::{
    Dispatcher, FileTopology, ListenerDefinition, ManualTopology, ServerConfig, TopologySource,
};
use portico_demos::default_registry;

#[derive(Parser)]
#[command(name = "Echo Server")]
#[command(version = "0.1.0")]
#[command(about = "An example of a portico server with a live listener topology", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 7000)]
    port: u16,
    /// JSON array of listener definitions, re-read while running
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let host = IpAddr::from_str(&cli.host)?;
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    if cli.debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }

    let topology: Box<dyn TopologySource> = match cli.config {
        Some(path) => {
            info!("watching topology file {}", path.display());
            Box::new(FileTopology::new(path))
        }
        None => {
            let (topology, handle) = ManualTopology::new();
            handle.add(
                ListenerDefinition::new("echo", cli.port)
                    .with_name("Echo service")
                    .with_handler("echo", Value::Null),
            );
            info!("try `nc {} {}` in another shell", host, cli.port);
            Box::new(topology)
        }
    };

    let config = ServerConfig::new()
        .server_id("echo-server")
        .bind_host(host)
        .poll_timeout(Duration::from_millis(200));
    let mut dispatcher = Dispatcher::new(config, default_registry(), topology)?;

    info!("Press ctrl-c to stop");
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    dispatcher.run(&stop_rx)?;
    info!("echo server stopped");

    Ok(())
}
