//! S3 backend.
//!
//! Appends go through `PutObject` with a write offset, so every block is
//! conditional on the object having exactly the size we expect. The bucket
//! must support appends (e.g. S3 Express One Zone directory buckets).
//!
//! SDK-level retries are disabled; appends are only ever retried by the
//! upload driver, through [`S3AppendObject::append_block`].

use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketInfo, BucketLocationConstraint, BucketType, CreateBucketConfiguration, DataRedundancy,
    LocationInfo, LocationType,
};
use aws_sdk_s3::Client;
use aws_types::region::Region;
use bytes::Bytes;
use tracing::{debug, info, warn};
use url::Url;

use super::{AppendObject, BlobStore, StoreError};
use crate::config::StoreConfig;

const DEFAULT_REGION: &str = "us-east-1";
const DIRECTORY_BUCKET_SUFFIX: &str = "--x-s3";

/// Availability zone of a directory bucket name like `blobs--use1-az4--x-s3`.
fn directory_bucket_zone(name: &str) -> Option<&str> {
    let (_, zone) = name.strip_suffix(DIRECTORY_BUCKET_SUFFIX)?.rsplit_once("--")?;
    (!zone.is_empty()).then_some(zone)
}

fn bucket_configuration(name: &str, region: &str) -> Option<CreateBucketConfiguration> {
    if let Some(zone) = directory_bucket_zone(name) {
        return Some(
            CreateBucketConfiguration::builder()
                .location(
                    LocationInfo::builder()
                        .r#type(LocationType::AvailabilityZone)
                        .name(zone)
                        .build(),
                )
                .bucket(
                    BucketInfo::builder()
                        .data_redundancy(DataRedundancy::SingleAvailabilityZone)
                        .r#type(BucketType::Directory)
                        .build(),
                )
                .build(),
        );
    }

    (region != DEFAULT_REGION).then(|| {
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build()
    })
}

fn status_code<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn is_transient<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => {
            matches!(status_code(err), Some(code) if code == 429 || (500..600).contains(&code))
        }
        _ => false,
    }
}

fn request_error<E>(operation: &'static str, target: String, err: SdkError<E>) -> StoreError
where
    aws_sdk_s3::Error: From<SdkError<E>>,
{
    StoreError::Request {
        operation,
        target,
        transient: is_transient(&err),
        source: Box::new(aws_sdk_s3::Error::from(err)),
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    region: String,
}

impl S3Store {
    pub async fn connect(config: &StoreConfig, endpoint: &Url) -> Self {
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_owned());

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(endpoint.as_str().trim_end_matches('/'))
            .region(Region::new(region.clone()))
            .retry_config(RetryConfig::disabled());

        if let (Some(ak), Some(sk)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(ak, sk, None, None, "Static"));
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        S3Store {
            client: Client::from_conf(s3_config),
            region,
        }
    }

    /// Size of the object, or `None` if it doesn't exist.
    async fn object_size(&self, bucket: &str, key: &str) -> Result<Option<u64>, StoreError> {
        head_object_size(&self.client, bucket, key).await
    }
}

async fn head_object_size(
    client: &Client,
    bucket: &str,
    key: &str,
) -> Result<Option<u64>, StoreError> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(out) => Ok(Some(out.content_length().unwrap_or(0).max(0) as u64)),
        Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
        Err(err) => Err(request_error(
            "head object",
            format!("{}/{}", bucket, key),
            err,
        )),
    }
}

impl BlobStore for S3Store {
    type Object = S3AppendObject;

    async fn ensure_container(&self, name: &str) -> Result<(), StoreError> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(_) => {
                debug!("bucket {} exists", name);
                return Ok(());
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {}
            Err(err) => return Err(request_error("head bucket", name.to_owned(), err)),
        }

        if directory_bucket_zone(name).is_none() {
            warn!(
                "creating general purpose bucket {}, appends need a store that supports write offsets",
                name
            );
        }

        let res = self
            .client
            .create_bucket()
            .bucket(name)
            .set_create_bucket_configuration(bucket_configuration(name, &self.region))
            .send()
            .await;

        match res {
            Ok(_) => {
                info!("created bucket {}", name);
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(err) => Err(request_error("create bucket", name.to_owned(), err)),
        }
    }

    async fn ensure_append_object(
        &self,
        container: &str,
        name: &str,
    ) -> Result<S3AppendObject, StoreError> {
        let offset = match self.object_size(container, name).await? {
            Some(size) => {
                info!(
                    "object {}/{} exists with {} bytes, appending after them",
                    container, name, size
                );
                size
            }
            None => {
                let res = self
                    .client
                    .put_object()
                    .bucket(container)
                    .key(name)
                    .if_none_match("*")
                    .body(ByteStream::from_static(b""))
                    .send()
                    .await;

                match res {
                    Ok(_) => {
                        info!("created object {}/{}", container, name);
                        0
                    }
                    // someone else created it between our head and put
                    Err(err) if status_code(&err) == Some(412) => {
                        self.object_size(container, name).await?.unwrap_or(0)
                    }
                    Err(err) => {
                        return Err(request_error(
                            "create object",
                            format!("{}/{}", container, name),
                            err,
                        ))
                    }
                }
            }
        };

        Ok(S3AppendObject {
            client: self.client.clone(),
            bucket: container.to_owned(),
            key: name.to_owned(),
            offset,
            unconfirmed: false,
        })
    }
}

pub struct S3AppendObject {
    client: Client,
    bucket: String,
    key: String,
    offset: u64,
    // Set when the last append failed without telling us whether it landed.
    unconfirmed: bool,
}

impl S3AppendObject {
    fn target(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Settles the outcome of a failed append before retrying `block`.
    /// Returns true if the previous attempt did land.
    async fn reconcile(&mut self, block: &Bytes) -> Result<bool, StoreError> {
        let size = head_object_size(&self.client, &self.bucket, &self.key)
            .await?
            .unwrap_or(0);
        let landed = self.offset + block.len() as u64;

        if size == landed {
            warn!(
                "previous append to {} at offset {} was stored, not resending",
                self.target(),
                self.offset
            );
            self.offset = landed;
            self.unconfirmed = false;
            return Ok(true);
        }
        if size != self.offset {
            return Err(StoreError::PositionMismatch {
                key: self.target(),
                expected: self.offset,
                actual: size,
            });
        }

        self.unconfirmed = false;
        Ok(false)
    }
}

impl AppendObject for S3AppendObject {
    async fn append_block(&mut self, block: Bytes) -> Result<(), StoreError> {
        if self.unconfirmed && self.reconcile(&block).await? {
            return Ok(());
        }

        let len = block.len() as u64;
        let res = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .write_offset_bytes(self.offset as i64)
            .body(ByteStream::from(block))
            .send()
            .await;

        match res {
            Ok(_) => {
                debug!("appended {} bytes to {} at offset {}", len, self.target(), self.offset);
                self.offset += len;
                Ok(())
            }
            Err(err) => {
                self.unconfirmed = true;
                Err(request_error("append block", self.target(), err))
            }
        }
    }
}
