use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::inference::{hub_api, load_video_handler};
use crate::routes::AppState;
use crate::telemetry::init_telemetry;
use crate::theme::Theme;

mod config;
mod error;
mod inference;
mod routes;
mod telemetry;
mod theme;
mod ui;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, config_error) = match Config::from_toml(&args.config_file) {
        Ok(conf) => (conf.merge(args.opt_config), None),
        Err(err) => (Config::default().merge(args.opt_config), Some(err)),
    };

    init_telemetry(config.otlp_endpoint().as_deref(), config.console)?;

    if let Some(err) = config_error {
        if args.config_file != DEFAULT_CONFIG_FILE {
            exit_err!(
                1,
                "Failed to read configuration file {} with error: {:#}",
                args.config_file,
                err
            );
        }
        debug!("Using defaults, {} not read: {:#}", args.config_file, err);
    }

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let load_config = config.clone();
    let load = move || load_video_handler(&load_config, &hub_api(&load_config)?);
    let (handler, model) = match tokio::task::spawn_blocking(load).await {
        Ok(Ok(loaded)) => loaded,
        Ok(Err(err)) => exit_err!(1, "Failed to load model {}: {:#}", config.model_id, err),
        Err(err) => exit_err!(1, "Model loading did not finish: {}", err),
    };

    let page = match ui::render_page(&Theme::orange_red(), &model) {
        Ok(page) => page,
        Err(err) => exit_err!(1, "Failed to render the page: {:#}", err),
    };

    let upload_dir = PathBuf::from(&config.upload_dir);
    if let Err(err) = tokio::fs::create_dir_all(&upload_dir).await {
        exit_err!(
            1,
            "Failed to create upload directory {:?}: {}",
            upload_dir,
            err
        );
    }

    let state = AppState {
        handler: Arc::new(handler),
        model: Arc::new(model),
        page: Arc::new(page),
        examples_dir: PathBuf::from(&config.examples_dir),
        upload_dir,
    };
    let router = routes::router(state, config.max_upload_size);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        {
            tracing::error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
