//! S3-compatible upstream client
//!
//! Presigned URLs and multipart assist speak the S3 API directly (the only
//! provider family the presign path supports); everything else goes through
//! the transfer engine.

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;

use bucketd_core::models::{Profile, StorageProvider};

use crate::UploadError;

/// Default lifetime for presigned URLs.
pub const PRESIGN_EXPIRES_SECS: u64 = 3600;

/// Build a client from profile credentials. Presign and multipart assist
/// are S3-compatible only.
pub fn client_for(profile: &Profile) -> Result<Client, UploadError> {
    if profile.provider != StorageProvider::S3 {
        return Err(UploadError::UnsupportedProvider(profile.provider));
    }
    let access_key = profile
        .access_key
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UploadError::InvalidRequest("profile has no access key".into()))?;
    let secret_key = profile
        .secret_key
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UploadError::InvalidRequest("profile has no secret key".into()))?;

    let credentials = Credentials::new(
        access_key,
        secret_key,
        profile.session_token.clone().filter(|s| !s.is_empty()),
        None,
        "bucketd-profile",
    );

    let region = profile
        .region
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "us-east-1".to_string());

    let mut builder = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(Region::new(region))
        .force_path_style(profile.path_style);
    if let Some(endpoint) = profile.endpoint.clone().filter(|s| !s.is_empty()) {
        builder = builder.endpoint_url(endpoint);
    }
    Ok(Client::from_conf(builder.build()))
}

fn presign_config(expires_secs: u64) -> Result<PresigningConfig, UploadError> {
    PresigningConfig::expires_in(Duration::from_secs(expires_secs))
        .map_err(|e| UploadError::InvalidRequest(format!("bad presign expiry: {}", e)))
}

pub async fn presign_put(
    client: &Client,
    bucket: &str,
    key: &str,
    expires_secs: u64,
) -> Result<String, UploadError> {
    let presigned = client
        .put_object()
        .bucket(bucket)
        .key(key)
        .presigned(presign_config(expires_secs)?)
        .await
        .map_err(|e| UploadError::Upstream(e.to_string()))?;
    Ok(presigned.uri().to_string())
}

pub async fn create_multipart(
    client: &Client,
    bucket: &str,
    key: &str,
) -> Result<String, UploadError> {
    let created = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| UploadError::Upstream(e.to_string()))?;
    created
        .upload_id()
        .map(str::to_string)
        .ok_or_else(|| UploadError::Upstream("upstream returned no upload id".into()))
}

pub async fn presign_upload_part(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: i32,
    expires_secs: u64,
) -> Result<String, UploadError> {
    let presigned = client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .part_number(part_number)
        .presigned(presign_config(expires_secs)?)
        .await
        .map_err(|e| UploadError::Upstream(e.to_string()))?;
    Ok(presigned.uri().to_string())
}

pub async fn upload_part(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: i32,
    body: Bytes,
) -> Result<String, UploadError> {
    let uploaded = client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .part_number(part_number)
        .body(body.into())
        .send()
        .await
        .map_err(|e| UploadError::Upstream(e.to_string()))?;
    Ok(uploaded.e_tag().unwrap_or_default().to_string())
}

/// (part_number, size, etag) for every part the upstream has accepted.
pub async fn list_parts(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<Vec<(i32, i64, String)>, UploadError> {
    let mut parts = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let mut req = client
            .list_parts()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id);
        if let Some(m) = &marker {
            req = req.part_number_marker(m.clone());
        }
        let page = req
            .send()
            .await
            .map_err(|e| UploadError::Upstream(e.to_string()))?;
        for part in page.parts() {
            parts.push((
                part.part_number().unwrap_or_default(),
                part.size().unwrap_or_default(),
                part.e_tag().unwrap_or_default().to_string(),
            ));
        }
        if page.is_truncated().unwrap_or(false) {
            marker = page.next_part_number_marker().map(str::to_string);
        } else {
            return Ok(parts);
        }
    }
}

pub async fn complete_multipart(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    parts: &[(i32, String)],
) -> Result<(), UploadError> {
    let completed = CompletedMultipartUpload::builder()
        .set_parts(Some(
            parts
                .iter()
                .map(|(number, etag)| {
                    CompletedPart::builder()
                        .part_number(*number)
                        .e_tag(etag)
                        .build()
                })
                .collect(),
        ))
        .build();
    client
        .complete_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .multipart_upload(completed)
        .send()
        .await
        .map_err(|e| UploadError::Upstream(e.to_string()))?;
    Ok(())
}

pub async fn abort_multipart(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<(), UploadError> {
    client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
        .map_err(|e| UploadError::Upstream(e.to_string()))?;
    Ok(())
}
