mod config;
mod decode;
mod digit_model;
mod prediction;
mod preprocess;
mod service;

use config::ServerConfig;
use decode::ImageFetcher;
use digit_model::DigitModel;
use service::{DigitRecognizerService, digit_recognizer_service};
use std::sync::Arc;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use digit_recognizer_service::digit_recognizer_server::DigitRecognizerServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;

    // The model is loaded once, before the server binds; without it there is
    // nothing to serve.
    let model = DigitModel::new(&config.model_dir).inspect_err(|err| {
        tracing::error!(error = %err, path = ?config.model_path(), "failed to load digit model");
    })?;
    let fetcher = ImageFetcher::new(config.fetch_timeout, config.fetch_max_bytes)?;
    let recognizer = DigitRecognizerService::new(Arc::new(model), fetcher);

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(digit_recognizer_service::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    tracing::info!(addr = %config.addr, "DigitRecognizer server listening");

    Server::builder()
        .add_service(DigitRecognizerServer::new(recognizer))
        .add_service(reflection_service)
        .serve_with_shutdown(config.addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
