use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    low_level,
};
use silo::{Config, Server, ServerError};
use silo_codec::Dictionary;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Compressed file-serving daemon.
#[derive(Parser)]
#[command(name = "silod", version)]
struct Args {
    /// Path to the binary configuration file.
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match serve(&Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn serve(args: &Args) -> Result<(), ServerError> {
    let config = Config::load(&args.config)?;
    let dict = Dictionary::load(silo_codec::DICT_FILE_NAME)?;
    let server = Server::bind(config, dict)?;

    // a signal behaves like a remote shutdown request
    let stop = server.stop_flag();
    for sig in [SIGINT, SIGTERM] {
        let stop = Arc::clone(&stop);
        unsafe { low_level::register(sig, move || stop.trigger()) }
            .map_err(ServerError::Signal)?;
    }

    server.run()
}
