use std::time::Duration;

use anyhow::{Context, Result};
use blobgen::config::StoreConfig;
use blobgen::store::S3Store;
use blobgen::{BlobRequest, ProgressSink, RemainderPolicy, RetryPolicy, UploadPlan, UploadProgress};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Create a blob file in a storage container of a provided size.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The size of the file to create in megabytes
    #[arg(long, default_value_t = 100, allow_negative_numbers = true)]
    file_size: i64,

    /// Name of the blob to create. A random name is generated by default.
    #[arg(short, long)]
    name: Option<String>,

    /// URL of the blob service. Overrides `endpoint` from the config file.
    #[arg(long)]
    blob_url: Option<String>,

    #[arg(long)]
    blob_container_name: String,

    /// Size of each appended block in megabytes
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    chunk_size: i64,

    /// Shorten the last block so the blob is exactly --file-size
    #[arg(long)]
    exact_size: bool,

    /// Retries per block on transient errors
    #[arg(long, default_value_t = 0)]
    max_retries: u32,

    /// Seed for the random content
    #[arg(long)]
    seed: Option<u64>,
}

fn hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

struct StatusLine;

impl ProgressSink for StatusLine {
    fn on_chunk(&mut self, index: u64, progress: &UploadProgress) {
        info!(
            "{:?}: Uploaded block #{}/{}",
            progress.elapsed,
            index + 1,
            progress.total_chunks
        );
    }

    fn on_complete(&mut self, progress: &UploadProgress) {
        println!("Upload took {}", hms(progress.elapsed));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store_config = StoreConfig::from_env().context("error loading store config")?;

    let remainder = if args.exact_size {
        RemainderPolicy::Truncate
    } else {
        RemainderPolicy::Pad
    };
    let plan = UploadPlan::from_mebibytes(args.file_size, args.chunk_size)?.with_remainder(remainder);

    let request = BlobRequest {
        endpoint: args.blob_url.or_else(|| store_config.endpoint.clone()),
        container: args.blob_container_name,
        name: args.name.unwrap_or_else(blobgen::random_object_name),
        plan,
        retry: RetryPolicy::default().with_max_retries(args.max_retries),
        seed: args.seed,
    };
    let target = format!(
        "{}/{} in {}",
        request.container,
        request.name,
        request.endpoint.as_deref().unwrap_or("<no endpoint>")
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("error building runtime")?;

    let store_config = &store_config;
    rt.block_on(blobgen::run(
        request,
        |endpoint| async move { S3Store::connect(store_config, &endpoint).await },
        &mut StatusLine,
    ))
    .with_context(|| format!("error creating blob {}", target))?;

    Ok(())
}
