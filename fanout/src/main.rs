use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use lambda_fanout::{
    config::{load_requests, FanoutConfig},
    invoke_batch, Credentials, Dispatcher,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
/// Invoke a batch of Lambda functions concurrently.
struct Args {
    /// YAML or JSON list of invocation requests.
    #[arg(long)]
    requests: PathBuf,

    /// Optional YAML config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default region for requests that do not name one.
    #[arg(long)]
    region: Option<String>,

    /// Report every invocation's outcome instead of failing on the first error.
    #[arg(long)]
    settled: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => FanoutConfig::from_yaml_bytes(
            &tokio::fs::read(path)
                .await
                .with_context(|| format!("read config {}", path.display()))?,
        )?,
        None => FanoutConfig::default(),
    };
    let requests = load_requests(
        &tokio::fs::read(&args.requests)
            .await
            .with_context(|| format!("read requests {}", args.requests.display()))?,
    )?;

    let (credentials, ambient_region) = Credentials::resolve(args.region.clone()).await?;
    cfg.default_region = args
        .region
        .or(cfg.default_region)
        .or(ambient_region);
    tracing::info!(
        requests = requests.len(),
        default_region = cfg.default_region.as_deref().unwrap_or("-"),
        "starting"
    );

    let credentials = Arc::new(credentials);
    let output = if args.settled {
        let dispatcher = Dispatcher::for_batch(credentials, &cfg)?;
        let results = dispatcher
            .invoke_all_settled(&requests, cfg.default_region.as_deref())
            .await?;
        drop(dispatcher);
        Value::Array(
            results
                .into_iter()
                .map(|result| match result {
                    Ok(value) => json!({ "ok": value }),
                    Err(failure) => json!({ "error": failure }),
                })
                .collect(),
        )
    } else {
        Value::Array(invoke_batch(credentials, &requests, &cfg).await?)
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
