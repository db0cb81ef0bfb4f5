use std::io;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

mod addr;
mod allocator;
mod cni;
mod config;
mod error;
mod netlink;
mod orchestrator;
mod portmap;
mod store;

use cni::args::{CniArgs, Command};
use cni::schema::ErrorReply;
use config::StoreConfig;
use error::Error;
use orchestrator::Context;
use store::Store;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "invocation failed");
            let reply = ErrorReply {
                cni_version: "0.4.0".to_string(),
                code: error.cni_code(),
                message: error.to_string(),
                details: std::error::Error::source(&error).map(|source| source.to_string()),
            };
            match serde_json::to_string(&reply) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("{{\"cniVersion\":\"0.4.0\",\"code\":7,\"msg\":{:?}}}", error.to_string()),
            }
            ExitCode::FAILURE
        }
    }
}

/// Parse the process environment and stdin, dispatch to the orchestrator,
/// and return the exact stdout payload a success should print (empty for
/// `DEL`/`CHECK`, the CNI result JSON for `ADD`).
async fn run() -> Result<String, Error> {
    let args = CniArgs::from_env()?;
    let config = config::read_netconf(io::stdin())?;
    let store_config = StoreConfig::from_env();
    let store = Store::open(&store_config.db_path)?;
    let ctx = Context::build(args, config, store).await?;

    match ctx.args.command {
        Command::Add => {
            let result = orchestrator::add(&ctx).await?;
            Ok(serde_json::to_string_pretty(&result).map_err(|err| Error::Config(err.to_string()))?)
        }
        Command::Del => {
            orchestrator::del(&ctx).await?;
            Ok(String::new())
        }
        Command::Check => {
            orchestrator::check(&ctx).await?;
            Ok(String::new())
        }
    }
}

/// Install a `tracing_subscriber::fmt` subscriber once per invocation,
/// filtered by `RUST_LOG` (default `info`). `CNI_LOG_FILE`, when set,
/// redirects the log sink to that file in append mode so stderr stays
/// reserved for the CNI error JSON.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var("CNI_LOG_FILE") {
        Ok(path) if !path.is_empty() => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                builder.with_writer(move || file.try_clone().expect("log file handle")).init();
                return;
            }
        }
        _ => {}
    }

    builder.with_writer(io::stderr).init();
}
