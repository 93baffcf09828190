//! Fills an append-only object in a blob store with random data of a given
//! size, one block at a time, for load and capacity testing.

use std::future::Future;

use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::info;
use url::Url;

pub mod config;
pub mod error;
pub mod plan;
pub mod store;
pub mod upload;

pub use error::{Error, Result};
pub use plan::{
    Chunk, ChunkGenerator, RemainderPolicy, UploadPlan, MAX_CHUNK_SIZE_BYTES, MEBIBYTE,
};
pub use store::{AppendObject, BlobStore, StoreError};
pub use upload::{ProgressSink, RetryPolicy, UploadProgress, UploadState, Uploader};

/// Everything needed to create one blob, validated up front.
#[derive(Debug, Clone)]
pub struct BlobJob {
    endpoint: Url,
    container: String,
    name: String,
    plan: UploadPlan,
    retry: RetryPolicy,
    seed: Option<u64>,
}

impl BlobJob {
    /// Fails with [`Error::Configuration`] before any backend is contacted
    /// if the endpoint is missing or not an absolute URL.
    pub fn new(
        endpoint: Option<&str>,
        container: impl Into<String>,
        name: impl Into<String>,
        plan: UploadPlan,
    ) -> Result<Self> {
        let endpoint = config::parse_endpoint(endpoint)?;
        let container = container.into();
        if container.is_empty() {
            return Err(Error::configuration("the container name is empty"));
        }

        Ok(BlobJob {
            endpoint,
            container,
            name: name.into(),
            plan,
            retry: RetryPolicy::default(),
            seed: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plan(&self) -> &UploadPlan {
        &self.plan
    }
}

/// Unvalidated job parameters as they come from the command line.
#[derive(Debug, Clone)]
pub struct BlobRequest {
    pub endpoint: Option<String>,
    pub container: String,
    pub name: String,
    pub plan: UploadPlan,
    pub retry: RetryPolicy,
    pub seed: Option<u64>,
}

impl BlobRequest {
    pub fn into_job(self) -> Result<BlobJob> {
        Ok(
            BlobJob::new(self.endpoint.as_deref(), self.container, self.name, self.plan)?
                .with_retry(self.retry)
                .with_seed(self.seed),
        )
    }
}

/// Validates `request`, connects to the endpoint with `connect` and creates
/// the blob. `connect` is never called for an invalid request.
pub async fn run<B, C, F, S>(
    request: BlobRequest,
    connect: C,
    sink: &mut S,
) -> Result<UploadProgress>
where
    B: BlobStore,
    C: FnOnce(Url) -> F,
    F: Future<Output = B>,
    S: ProgressSink + ?Sized,
{
    let job = request.into_job()?;

    info!("connecting to blob storage {}", job.endpoint);
    let store = connect(job.endpoint.clone()).await;

    create_blob(&store, &job, sink).await
}

/// Makes sure the container and the append object exist, then appends the
/// job's random chunks to it.
pub async fn create_blob<B, S>(store: &B, job: &BlobJob, sink: &mut S) -> Result<UploadProgress>
where
    B: BlobStore,
    S: ProgressSink + ?Sized,
{
    info!("creating container {} if it doesn't exist", job.container);
    store
        .ensure_container(&job.container)
        .await
        .map_err(|source| Error::RemoteSetup {
            operation: "ensure container",
            target: job.container.clone(),
            source,
        })?;

    let mut object = store
        .ensure_append_object(&job.container, &job.name)
        .await
        .map_err(|source| Error::RemoteSetup {
            operation: "ensure append object",
            target: format!("{}/{}", job.container, job.name),
            source,
        })?;

    let chunks = match job.seed {
        Some(seed) => ChunkGenerator::with_seed(&job.plan, seed),
        None => ChunkGenerator::new(&job.plan),
    };

    info!(
        "starting the upload of {} bytes to {}/{}",
        job.plan.upload_size_bytes(),
        job.container,
        job.name
    );
    Uploader::new(job.retry)
        .upload(&mut object, chunks, sink)
        .await
}

fn random_chars<R: Rng>(rng: &mut R, len: usize) -> String {
    (&mut *rng)
        .sample_iter(Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// A random name like `k3v9x0qa.m2z`.
pub fn random_object_name() -> String {
    let mut rng = rand::rng();
    let stem = random_chars(&mut rng, 8);
    let ext = random_chars(&mut rng, 3);
    format!("{}.{}", stem, ext)
}
