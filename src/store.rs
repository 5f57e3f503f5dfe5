//! Packfile blob storage on S3-compatible object stores.
//!
//! Packs stream in with unknown length, so uploads go through the
//! multipart API: parts flush as the side-band reader produces data, and
//! an over-size repository aborts the upload without a trace. Keys are
//! `{github.com/owner/repo}/{unix_nanos}`, collision-free across retries;
//! orphans from failed fetches are swept offline.

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use thiserror::Error;

const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to start upload of {key}: {message}")]
    Start { key: String, message: String },

    #[error("failed to upload part {part} of {key}: {message}")]
    Part {
        key: String,
        part: i32,
        message: String,
    },

    #[error("failed to complete upload of {key}: {message}")]
    Complete { key: String, message: String },

    #[error("failed to abort upload of {key}: {message}")]
    Abort { key: String, message: String },
}

#[derive(Clone)]
pub struct PackStore {
    client: Client,
    bucket: String,
}

impl PackStore {
    /// Build a store against `bucket`, with credentials and region from the
    /// ambient AWS environment.
    pub async fn new(bucket: String) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        PackStore {
            client: Client::new(&config),
            bucket,
        }
    }

    pub async fn start_upload(&self, key: &str) -> Result<PackUpload, StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Start {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let upload_id = created.upload_id().unwrap_or_default().to_string();
        if upload_id.is_empty() {
            return Err(StoreError::Start {
                key: key.to_string(),
                message: "no upload id returned".to_string(),
            });
        }

        Ok(PackUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            buf: Vec::with_capacity(PART_SIZE),
            next_part: 1,
            total: 0,
        })
    }
}

/// One in-flight packfile upload. Call [`write`](Self::write) as data
/// arrives, then exactly one of [`complete`](Self::complete) or
/// [`abort`](Self::abort).
pub struct PackUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    buf: Vec<u8>,
    next_part: i32,
    /// Bytes accepted so far.
    pub total: u64,
}

impl PackUpload {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(chunk);
        self.total += chunk.len() as u64;
        while self.buf.len() >= PART_SIZE {
            let part: Vec<u8> = self.buf.drain(..PART_SIZE).collect();
            self.flush_part(part).await?;
        }
        Ok(())
    }

    async fn flush_part(&mut self, part: Vec<u8>) -> Result<(), StoreError> {
        let number = self.next_part;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(number)
            .body(ByteStream::from(part))
            .send()
            .await
            .map_err(|e| StoreError::Part {
                key: self.key.clone(),
                part: number,
                message: e.to_string(),
            })?;

        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .part_number(number)
                .build(),
        );
        self.next_part += 1;
        Ok(())
    }

    /// Flush the remainder and seal the object. Returns total bytes stored.
    pub async fn complete(mut self) -> Result<u64, StoreError> {
        if !self.buf.is_empty() || self.parts.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.flush_part(rest).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(self.parts.clone()))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StoreError::Complete {
                key: self.key.clone(),
                message: e.to_string(),
            })?;

        Ok(self.total)
    }

    /// Drop the upload; already-flushed parts are discarded by the store.
    pub async fn abort(self) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| StoreError::Abort {
                key: self.key.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}
