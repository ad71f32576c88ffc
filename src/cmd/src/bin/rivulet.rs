// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `rivulet` binary: `check`, `discover` and `read` over a PostgreSQL
//! capture configuration. All protocol output goes to stdout, one JSON
//! object per line; diagnostics go to stderr.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rivulet_connector::catalog::ConfiguredCatalog;
use rivulet_connector::config::CaptureConfig;
use rivulet_connector::handler;
use rivulet_connector::message::JsonLinesEmitter;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rivulet", about = "PostgreSQL change-data-capture connector")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify connectivity, the replication slot and the publication.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// List candidate streams and their source-defined keys.
    Discover {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the capture, emitting records and state checkpoints on stdout.
    Read {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

fn load<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {what} file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cannot parse {what} file"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    if let Err(e) = run(opts).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    match opts.command {
        Command::Check { config } => {
            let config: CaptureConfig = load(&config, "config")?;
            let result = handler::check(&config).await;
            println!("{}", serde_json::to_string(&result)?);
        }
        Command::Discover { config } => {
            let config: CaptureConfig = load(&config, "config")?;
            let catalog = handler::discover(&config).await?;
            println!("{}", serde_json::to_string(&catalog)?);
        }
        Command::Read {
            config,
            catalog,
            state,
        } => {
            let config: CaptureConfig = load(&config, "config")?;
            let catalog: ConfiguredCatalog = load(&catalog, "catalog")?;
            let state_blob = state
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("cannot read state file {}", path.display()))
                })
                .transpose()?;

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    signal_cancel.cancel();
                }
            });

            handler::read(
                &config,
                &catalog,
                state_blob.as_deref(),
                JsonLinesEmitter::stdout(),
                cancel,
            )
            .await?;
        }
    }
    Ok(())
}
