use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::{Error, Result};

/// 1 MiB, the unit used for sizes on the command line.
pub const MEBIBYTE: u64 = 1024 * 1024;

/// Largest block a single S3 `PutObject` accepts (5 GiB).
pub const MAX_CHUNK_SIZE_BYTES: u64 = 5 * 1024 * MEBIBYTE;

/// What to do when the total size is not a multiple of the chunk size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemainderPolicy {
    /// Every chunk is full size; the object may end up larger than requested.
    #[default]
    Pad,
    /// The last chunk is shortened so the object is exactly the requested size.
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPlan {
    total_size_bytes: u64,
    chunk_size_bytes: u64,
    remainder: RemainderPolicy,
}

impl UploadPlan {
    pub fn new(total_size_bytes: u64, chunk_size_bytes: u64) -> Result<Self> {
        if chunk_size_bytes == 0 {
            return Err(Error::invalid_plan("chunk size must be greater than zero"));
        }
        if chunk_size_bytes > MAX_CHUNK_SIZE_BYTES {
            return Err(Error::invalid_plan(format!(
                "chunk size of {} bytes exceeds the {} byte limit of a single append",
                chunk_size_bytes, MAX_CHUNK_SIZE_BYTES
            )));
        }
        if usize::try_from(chunk_size_bytes).is_err() {
            return Err(Error::invalid_plan(format!(
                "chunk size of {} bytes does not fit in memory",
                chunk_size_bytes
            )));
        }

        Ok(UploadPlan {
            total_size_bytes,
            chunk_size_bytes,
            remainder: RemainderPolicy::default(),
        })
    }

    /// Builds a plan from sizes expressed in mebibytes, as taken from the command line.
    pub fn from_mebibytes(size: i64, chunk_size: i64) -> Result<Self> {
        if size < 0 {
            return Err(Error::invalid_plan(format!(
                "size must not be negative, got {}",
                size
            )));
        }
        if chunk_size <= 0 {
            return Err(Error::invalid_plan(format!(
                "chunk size must be greater than zero, got {}",
                chunk_size
            )));
        }

        let total = (size as u64)
            .checked_mul(MEBIBYTE)
            .ok_or_else(|| Error::invalid_plan(format!("size of {} MiB is too large", size)))?;
        let chunk = (chunk_size as u64).checked_mul(MEBIBYTE).ok_or_else(|| {
            Error::invalid_plan(format!("chunk size of {} MiB is too large", chunk_size))
        })?;

        Self::new(total, chunk)
    }

    pub fn with_remainder(self, remainder: RemainderPolicy) -> Self {
        UploadPlan { remainder, ..self }
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_bytes
    }

    pub fn remainder(&self) -> RemainderPolicy {
        self.remainder
    }

    pub fn chunk_count(&self) -> u64 {
        self.total_size_bytes.div_ceil(self.chunk_size_bytes)
    }

    /// Payload length of the chunk at `index`.
    pub fn chunk_len(&self, index: u64) -> u64 {
        match self.remainder {
            RemainderPolicy::Pad => self.chunk_size_bytes,
            RemainderPolicy::Truncate => {
                let offset = index.saturating_mul(self.chunk_size_bytes);
                self.chunk_size_bytes
                    .min(self.total_size_bytes.saturating_sub(offset))
            }
        }
    }

    /// Number of bytes the remote object grows by once every chunk is appended.
    pub fn upload_size_bytes(&self) -> u64 {
        match self.remainder {
            RemainderPolicy::Pad => self.chunk_count().saturating_mul(self.chunk_size_bytes),
            RemainderPolicy::Truncate => self.total_size_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u64,
    pub payload: Bytes,
}

/// Lazily produces the random chunks of a plan, in index order.
///
/// A single rng is seeded once and drawn from for every chunk. The sequence
/// cannot be replayed; build a new generator to start over.
pub struct ChunkGenerator {
    plan: UploadPlan,
    next_index: u64,
    rng: StdRng,
}

impl ChunkGenerator {
    pub fn new(plan: &UploadPlan) -> Self {
        Self::with_rng(plan, StdRng::from_rng(&mut rand::rng()))
    }

    /// Generator whose payloads are fully determined by `seed`.
    pub fn with_seed(plan: &UploadPlan, seed: u64) -> Self {
        Self::with_rng(plan, StdRng::seed_from_u64(seed))
    }

    fn with_rng(plan: &UploadPlan, rng: StdRng) -> Self {
        ChunkGenerator {
            plan: *plan,
            next_index: 0,
            rng,
        }
    }

    pub fn plan(&self) -> &UploadPlan {
        &self.plan
    }
}

impl Iterator for ChunkGenerator {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next_index >= self.plan.chunk_count() {
            return None;
        }

        let index = self.next_index;
        self.next_index += 1;

        // chunk_len never exceeds the chunk size, which new() checked fits in usize
        let mut payload = vec![0u8; self.plan.chunk_len(index) as usize];
        self.rng.fill_bytes(&mut payload);

        Some(Chunk {
            index,
            payload: Bytes::from(payload),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.plan.chunk_count() - self.next_index;
        match usize::try_from(left) {
            Ok(left) => (left, Some(left)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl ExactSizeIterator for ChunkGenerator {}
