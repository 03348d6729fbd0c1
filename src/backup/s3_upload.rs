// backuptool/src/backup/s3_upload.rs
use aws_sdk_s3 as s3;
use chrono::{DateTime, Local};
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use s3::primitives::ByteStream;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::config::UploadConfig;
use crate::errors::{BackupError, Result};

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Error codes S3-compatible services use for credential or signature rejection.
const AUTH_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
    "AuthorizationHeaderMalformed",
];

/// Destination for finished archives. The object only becomes visible once
/// `put_object` returns `Ok`.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        object_name: &str,
        source_path: &Path,
        content_type: &str,
    ) -> Result<()>;
}

/// Object name for a run started at `started_at`: `[prefix/]<strftime(format)>.tar.gz`.
pub fn object_name(upload: &UploadConfig, started_at: DateTime<Local>) -> anyhow::Result<String> {
    let mut name = String::new();
    if let Some(prefix) = upload.prefix.as_deref().map(|p| p.trim_matches('/')) {
        if !prefix.is_empty() {
            name.push_str(prefix);
            name.push('/');
        }
    }
    write!(name, "{}", started_at.format(&upload.format))
        .map_err(|_| anyhow::anyhow!("Invalid archive name format: {}", upload.format))?;
    name.push_str(ARCHIVE_SUFFIX);
    Ok(name)
}

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO).
pub struct S3ObjectStore {
    client: s3::Client,
}

impl S3ObjectStore {
    pub async fn connect(upload: &UploadConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&upload.endpoint)
            .region(Region::new(upload.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &upload.key_id,
                &upload.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        // MinIO and most self-hosted endpoints only accept path-style addressing.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
        }
    }
}

impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        object_name: &str,
        source_path: &Path,
        content_type: &str,
    ) -> Result<()> {
        info!(
            "Uploading {} to bucket {} as {}",
            source_path.display(),
            bucket,
            object_name
        );

        let body = ByteStream::from_path(source_path)
            .await
            .map_err(|e| BackupError::UploadTransfer {
                object: object_name.to_string(),
                reason: format!("cannot read {}: {}", source_path.display(), e),
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(object_name)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                let status = err.raw_response().map(|r| r.status().as_u16());
                classify_upload_failure(
                    object_name,
                    status,
                    err.code(),
                    DisplayErrorContext(&err).to_string(),
                )
            })?;

        info!("Uploaded {} to bucket {}", object_name, bucket);
        Ok(())
    }
}

/// Splits upload failures into credential/endpoint rejections and everything else.
pub(crate) fn classify_upload_failure(
    object_name: &str,
    status: Option<u16>,
    code: Option<&str>,
    reason: String,
) -> BackupError {
    let auth_status = matches!(status, Some(401 | 403));
    let auth_code = code.is_some_and(|c| AUTH_ERROR_CODES.contains(&c));
    if auth_status || auth_code {
        BackupError::UploadAuth {
            object: object_name.to_string(),
            reason,
        }
    } else {
        BackupError::UploadTransfer {
            object: object_name.to_string(),
            reason,
        }
    }
}
