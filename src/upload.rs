//! Sequential append upload driver.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::plan::Chunk;
use crate::store::AppendObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts per block after a transient failure. 0 makes every failure fatal.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    #[default]
    Idle,
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub state: UploadState,
    pub chunks_completed: u64,
    pub total_chunks: u64,
    pub bytes_uploaded: u64,
    pub elapsed: Duration,
}

/// Receives progress from the driver between appends.
pub trait ProgressSink {
    /// Called once for every block the backend acknowledged.
    fn on_chunk(&mut self, index: u64, progress: &UploadProgress);

    fn on_complete(&mut self, _progress: &UploadProgress) {}
}

impl<F> ProgressSink for F
where
    F: FnMut(u64, &UploadProgress),
{
    fn on_chunk(&mut self, index: u64, progress: &UploadProgress) {
        self(index, progress)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Uploader {
    retry: RetryPolicy,
}

impl Uploader {
    pub fn new(retry: RetryPolicy) -> Self {
        Uploader { retry }
    }

    /// Appends every chunk to `object`, strictly one after the other.
    ///
    /// The first failure that can't be retried stops the upload; chunks after
    /// it are never generated. Whatever was appended before stays in the object.
    pub async fn upload<O, I, S>(&self, object: &mut O, chunks: I, sink: &mut S) -> Result<UploadProgress>
    where
        O: AppendObject,
        I: IntoIterator<Item = Chunk>,
        I::IntoIter: ExactSizeIterator,
        S: ProgressSink + ?Sized,
    {
        let chunks = chunks.into_iter();
        let mut progress = UploadProgress {
            state: UploadState::Uploading,
            total_chunks: chunks.len() as u64,
            ..Default::default()
        };

        info!("uploading {} blocks", progress.total_chunks);
        let start = Instant::now();

        for Chunk { index, payload } in chunks {
            let len = payload.len() as u64;
            let mut attempt = 0;

            loop {
                // payload is released at the end of this iteration
                match object.append_block(payload.clone()).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                        let delay = self.retry.backoff(attempt);
                        attempt += 1;
                        warn!(
                            "append of block #{} failed (attempt {}/{}), retrying in {:?}: {}",
                            index + 1,
                            attempt,
                            self.retry.max_retries + 1,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        progress.state = UploadState::Failed;
                        progress.elapsed = start.elapsed();
                        return Err(Error::Append {
                            index,
                            completed: progress.chunks_completed,
                            elapsed: progress.elapsed,
                            source: e,
                        });
                    }
                }
            }

            progress.chunks_completed += 1;
            progress.bytes_uploaded += len;
            progress.elapsed = start.elapsed();
            debug!("block #{} done after {:?}", index + 1, progress.elapsed);
            sink.on_chunk(index, &progress);
        }

        progress.state = UploadState::Completed;
        progress.elapsed = start.elapsed();
        info!(
            "uploaded {} blocks ({} bytes) in {:?}",
            progress.chunks_completed, progress.bytes_uploaded, progress.elapsed
        );
        sink.on_complete(&progress);

        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::plan::{ChunkGenerator, UploadPlan};
    use crate::store::{BlobStore, MemoryStore, StoreError};

    async fn object(store: &MemoryStore) -> <MemoryStore as BlobStore>::Object {
        store.ensure_container("c").await.unwrap();
        store.ensure_append_object("c", "blob").await.unwrap()
    }

    fn chunk(index: u64, data: &'static [u8]) -> Chunk {
        Chunk {
            index,
            payload: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(10), Duration::from_secs(10));
        assert_eq!(retry.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_appends_in_order() {
        let store = MemoryStore::new();
        let mut object = object(&store).await;
        let mut seen = Vec::new();

        let chunks = vec![chunk(0, b"one,"), chunk(1, b"two,"), chunk(2, b"three")];
        let progress = Uploader::default()
            .upload(&mut object, chunks, &mut |index: u64, p: &UploadProgress| {
                seen.push((index, p.chunks_completed, p.total_chunks))
            })
            .await
            .unwrap();

        assert_eq!(store.object("c", "blob").unwrap(), b"one,two,three");
        assert_eq!(seen, vec![(0, 1, 3), (1, 2, 3), (2, 3, 3)]);
        assert_eq!(progress.state, UploadState::Completed);
        assert_eq!(progress.bytes_uploaded, 13);
    }

    #[tokio::test]
    async fn test_empty_plan_completes_immediately() {
        let store = MemoryStore::new();
        let mut object = object(&store).await;
        let plan = UploadPlan::new(0, 16).unwrap();
        let mut calls = 0;

        let progress = Uploader::default()
            .upload(&mut object, ChunkGenerator::new(&plan), &mut |_: u64, _: &UploadProgress| {
                calls += 1
            })
            .await
            .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(progress.chunks_completed, 0);
        assert_eq!(progress.total_chunks, 0);
        assert_eq!(progress.state, UploadState::Completed);
        assert_eq!(store.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_upload() {
        let store = MemoryStore::new();
        let mut object = object(&store).await;
        store.fail_append(3, false);
        let plan = UploadPlan::new(5 * 8, 8).unwrap();
        let mut calls = 0;

        let err = Uploader::new(RetryPolicy::default().with_max_retries(3))
            .upload(&mut object, ChunkGenerator::new(&plan), &mut |_: u64, _: &UploadProgress| {
                calls += 1
            })
            .await
            .unwrap_err();

        match err {
            Error::Append {
                index, completed, ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(completed, 2);
            }
            e => panic!("unexpected error {:?}", e),
        }
        assert_eq!(calls, 2);
        // permanent errors are not retried, and block 4 is never attempted
        assert_eq!(store.append_calls(), 3);
        assert_eq!(store.object("c", "blob").unwrap().len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let store = MemoryStore::new();
        let mut object = object(&store).await;
        store.fail_append(2, true);
        store.fail_append(3, true);

        let chunks = vec![chunk(0, b"a"), chunk(1, b"b"), chunk(2, b"c")];
        let progress = Uploader::new(RetryPolicy::default().with_max_retries(2))
            .upload(&mut object, chunks, &mut |_: u64, _: &UploadProgress| {})
            .await
            .unwrap();

        assert_eq!(store.object("c", "blob").unwrap(), b"abc");
        assert_eq!(progress.chunks_completed, 3);
        assert_eq!(store.append_calls(), 5);
        // 100ms + 200ms of backoff
        assert!(progress.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let store = MemoryStore::new();
        let mut object = object(&store).await;
        for call in 1..=3 {
            store.fail_append(call, true);
        }

        let err = Uploader::new(RetryPolicy::default().with_max_retries(2))
            .upload(&mut object, vec![chunk(0, b"a")], &mut |_: u64, _: &UploadProgress| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Append {
                index: 0,
                completed: 0,
                source: StoreError::Request { transient: true, .. },
                ..
            }
        ));
        assert_eq!(store.append_calls(), 3);
        assert_eq!(store.object("c", "blob").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_no_retries_by_default() {
        let store = MemoryStore::new();
        let mut object = object(&store).await;
        store.fail_append(1, true);

        let res = Uploader::default()
            .upload(&mut object, vec![chunk(0, b"a"), chunk(1, b"b")], &mut |_: u64, _: &UploadProgress| {})
            .await;

        assert!(matches!(res, Err(Error::Append { index: 0, completed: 0, .. })));
        assert_eq!(store.append_calls(), 1);
    }
}
