use std::path::PathBuf;
use std::process;

use clap::Parser;
use devtee::config::{Config, DEFAULT_BUFSIZE};
use devtee::engine::Engine;
use devtee::source::open_source;
use eyre::{Context, Result};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "devtee")]
#[command(about = "fan one character device out to multiple userspace copies")]
#[command(version)]
struct Args {
    /// comma-separated names for the created devices
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: String,

    /// path of the source character device
    #[arg(short = 'S', long = "source", value_name = "NAME")]
    source: PathBuf,

    /// size of the shared buffer in bytes
    #[arg(long, value_name = "SIZE", default_value_t = DEFAULT_BUFSIZE)]
    bufsize: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::new(args.source, &args.name, args.bufsize)?;

    let source = match open_source(&config.source) {
        Ok(fd) => fd,
        Err(errno) => {
            error!(path = %config.source.display(), %errno, "opening source failed");
            process::exit(errno as i32);
        }
    };

    let mut engine = Engine::new(source, &config).context("device setup failed")?;
    info!(
        devices = config.names.len(),
        source = %config.source.display(),
        bufsize = config.bufsize,
        "fanning out"
    );
    engine.run();
    info!("shutting down");
    Ok(())
}
