//! Mirador CLI - model introspection server
//!
//! # Commands
//!
//! - `serve` - Start the introspection server around the demo model
//! - `inspect` - Print dtype, shape and a summary of an NPY file
//! - `info` - Show version info

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use mirador::{
    api::ROUTES,
    config::{ServerConfig, DEFAULT_FAILURE_LOG, DEFAULT_MAX_BODY_BYTES},
    error::Result,
    hyperparams::Hyperparameters,
    model::AttentionOnlyTransformer,
    npy, observability,
    server::IntrospectionServer,
};

/// Seed used when neither `--seed` nor the hyperparameters provide one
const FALLBACK_SEED: u64 = 42;

/// Mirador - look inside a running sequence model
#[derive(Parser)]
#[command(name = "mirador")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the introspection server
    ///
    /// Examples:
    ///   mirador serve --port 8000
    ///   mirador serve --hyper hyper.json --seed 7
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, env = "MIRADOR_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to (0 picks a free port)
        #[arg(short, long, env = "MIRADOR_PORT", default_value = "0")]
        port: u16,

        /// Append-only failure log
        #[arg(long, env = "MIRADOR_FAILURE_LOG", default_value = DEFAULT_FAILURE_LOG)]
        failure_log: PathBuf,

        /// Largest accepted request body in bytes
        #[arg(long, env = "MIRADOR_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
        max_body_bytes: usize,

        /// Disable cross-origin requests
        #[arg(long, env = "MIRADOR_NO_CORS")]
        no_cors: bool,

        /// Hyperparameter JSON file (demo settings if omitted)
        #[arg(long, value_name = "FILE")]
        hyper: Option<PathBuf>,

        /// Random seed for weights and dropout
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print dtype, shape and value summary of an NPY file
    Inspect {
        /// NPY file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Show version info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            failure_log,
            max_body_bytes,
            no_cors,
            hyper,
            seed,
        } => {
            let config = ServerConfig {
                host,
                port,
                failure_log,
                max_body_bytes,
                cors: !no_cors,
            };
            serve(&config, hyper.as_deref(), seed).await?;
        },
        Commands::Inspect { file } => {
            inspect(&file)?;
        },
        Commands::Info => {
            println!("Mirador v{}", mirador::VERSION);
            println!("Model introspection server");
            println!();
            println!("Endpoints (GET or POST):");
            for route in ROUTES {
                println!("  {route}");
            }
        },
    }

    Ok(())
}

async fn serve(config: &ServerConfig, hyper_path: Option<&Path>, seed: Option<u64>) -> Result<()> {
    if let Err(e) = observability::init_tracing(observability::DEFAULT_FILTER) {
        eprintln!("Warning: {e}");
    }

    let hyper = match hyper_path {
        Some(path) => Hyperparameters::from_file(path)?,
        None => Hyperparameters::demo(),
    };
    let seed = seed
        .or_else(|| {
            hyper
                .get("seed")
                .and_then(mirador::Value::as_i64)
                .and_then(|s| u64::try_from(s).ok())
        })
        .unwrap_or(FALLBACK_SEED);

    let (model, params) = AttentionOnlyTransformer::from_hyperparameters(&hyper, seed)?;
    let server = IntrospectionServer::with_model(config, hyper, model, params, seed)?;
    let port = server.port();

    println!("Mirador listening on http://{}:{port}", config.host);
    println!();
    println!("Endpoints (GET or POST, body = JSON token ids):");
    for route in ROUTES {
        println!("  http://{}:{port}{route}", config.host);
    }
    println!();
    println!("Example:");
    println!("  curl -d '[[1, 2, 3]]' http://{}:{port}/attn_weights.npy -o attn.npy", config.host);
    println!();

    let mut handle = server.start()?;
    handle.ready().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown().await
}

fn inspect(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let (header, data_offset) = npy::read_header(&bytes)?;
    let tensor = npy::from_bytes(&bytes)?;

    println!("File:   {}", path.display());
    println!("dtype:  {} ({})", header.dtype, header.dtype.descr());
    println!("shape:  {:?}", header.shape);
    println!("header: {data_offset} bytes");

    let values = npy::to_f64_vec(&tensor);
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if !finite.is_empty() {
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        println!("min:    {min}");
        println!("max:    {max}");
        println!("mean:   {mean}");
    }
    if finite.len() < values.len() {
        println!("non-finite: {}", values.len() - finite.len());
    }
    Ok(())
}
