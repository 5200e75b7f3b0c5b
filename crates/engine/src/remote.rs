//! Per-invocation remote configuration
//!
//! Each engine launch gets its own config file holding the resolved
//! credentials for exactly one remote, written under `<root>/tmp/engine/`
//! with a random suffix and unlinked when the invocation finishes. TLS
//! material referenced by the profile is materialized the same way and
//! passed by flag.

use bucketd_core::models::{Profile, StorageProvider};
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::EngineError;

/// The remote section name inside every generated config file.
pub const REMOTE_NAME: &str = "target";

/// Everything one engine invocation needs to address a profile's remote.
#[derive(Debug)]
pub struct RemoteContext {
    pub config_path: PathBuf,
    /// Flags appended after the subcommand (TLS material, cert checks).
    pub extra_args: Vec<String>,
    tls_files: Vec<PathBuf>,
}

impl RemoteContext {
    /// Write the config (and TLS material) for `profile` under `tmp_root`.
    pub fn prepare(tmp_root: &Path, profile: &Profile) -> Result<Self, EngineError> {
        std::fs::create_dir_all(tmp_root)?;
        let suffix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let config_path = tmp_root.join(format!("{}.conf", suffix));
        std::fs::write(&config_path, render_config(profile))?;

        let mut extra_args = Vec::new();
        let mut tls_files = Vec::new();

        let mut write_pem = |tag: &str, pem: &str| -> Result<PathBuf, EngineError> {
            let path = tmp_root.join(format!("{}-{}.pem", suffix, tag));
            std::fs::write(&path, pem)?;
            Ok(path)
        };

        if let Some(ca) = profile.tls_ca_pem.as_deref().filter(|s| !s.is_empty()) {
            let path = write_pem("ca", ca)?;
            extra_args.push("--ca-cert".into());
            extra_args.push(path.display().to_string());
            tls_files.push(path);
        }
        if let Some(cert) = profile
            .tls_client_cert_pem
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            let path = write_pem("cert", cert)?;
            extra_args.push("--client-cert".into());
            extra_args.push(path.display().to_string());
            tls_files.push(path);
        }
        if let Some(key) = profile
            .tls_client_key_pem
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            let path = write_pem("key", key)?;
            extra_args.push("--client-key".into());
            extra_args.push(path.display().to_string());
            tls_files.push(path);
        }
        if profile.skip_verify {
            extra_args.push("--no-check-certificate".into());
        }

        Ok(Self {
            config_path,
            extra_args,
            tls_files,
        })
    }

    /// `target:bucket/prefix` spec for engine arguments.
    pub fn remote_spec(bucket: &str, key: &str) -> String {
        if key.is_empty() {
            format!("{}:{}", REMOTE_NAME, bucket)
        } else {
            format!("{}:{}/{}", REMOTE_NAME, bucket, key)
        }
    }

    /// Remove the config and TLS files. Idempotent.
    pub fn cleanup(&self) {
        for path in std::iter::once(&self.config_path).chain(self.tls_files.iter()) {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove engine temp file {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for RemoteContext {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn push_kv(out: &mut String, key: &str, value: &str) {
    if !value.is_empty() {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
}

/// Render the single-remote config file body for a profile.
fn render_config(profile: &Profile) -> String {
    let mut out = format!("[{}]\n", REMOTE_NAME);
    let access_key = profile.access_key.as_deref().unwrap_or("");
    let secret_key = profile.secret_key.as_deref().unwrap_or("");

    match profile.provider {
        StorageProvider::S3 => {
            push_kv(&mut out, "type", "s3");
            push_kv(&mut out, "provider", "Other");
            push_kv(&mut out, "access_key_id", access_key);
            push_kv(&mut out, "secret_access_key", secret_key);
            if let Some(token) = profile.session_token.as_deref() {
                push_kv(&mut out, "session_token", token);
            }
            if let Some(endpoint) = profile.endpoint.as_deref() {
                push_kv(&mut out, "endpoint", endpoint);
            }
            if let Some(region) = profile.region.as_deref() {
                push_kv(&mut out, "region", region);
            }
            push_kv(
                &mut out,
                "force_path_style",
                if profile.path_style { "true" } else { "false" },
            );
        }
        StorageProvider::Azure => {
            push_kv(&mut out, "type", "azureblob");
            push_kv(&mut out, "account", access_key);
            push_kv(&mut out, "key", secret_key);
            if let Some(endpoint) = profile.endpoint.as_deref() {
                push_kv(&mut out, "endpoint", endpoint);
            }
        }
        StorageProvider::Gcs => {
            push_kv(&mut out, "type", "google cloud storage");
            if !secret_key.is_empty() {
                push_kv(&mut out, "service_account_credentials", secret_key);
            }
            if let Some(endpoint) = profile.endpoint.as_deref() {
                push_kv(&mut out, "endpoint", endpoint);
            }
        }
        StorageProvider::Oci => {
            push_kv(&mut out, "type", "oracleobjectstorage");
            push_kv(&mut out, "namespace", access_key);
            if let Some(region) = profile.region.as_deref() {
                push_kv(&mut out, "region", region);
            }
            if let Some(endpoint) = profile.endpoint.as_deref() {
                push_kv(&mut out, "endpoint", endpoint);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn s3_profile() -> Profile {
        Profile {
            id: Uuid::new_v4(),
            name: "minio".into(),
            provider: StorageProvider::S3,
            endpoint: Some("http://127.0.0.1:9000".into()),
            region: Some("us-east-1".into()),
            access_key: Some("AK".into()),
            secret_key: Some("SK".into()),
            session_token: None,
            tls_ca_pem: None,
            tls_client_cert_pem: None,
            tls_client_key_pem: None,
            path_style: true,
            preserve_leading_slash: false,
            skip_verify: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn s3_config_carries_credentials_and_endpoint() {
        let body = render_config(&s3_profile());
        assert!(body.starts_with("[target]\n"));
        assert!(body.contains("type = s3"));
        assert!(body.contains("access_key_id = AK"));
        assert!(body.contains("secret_access_key = SK"));
        assert!(body.contains("endpoint = http://127.0.0.1:9000"));
        assert!(body.contains("force_path_style = true"));
    }

    #[test]
    fn prepare_writes_and_cleanup_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut profile = s3_profile();
        profile.tls_ca_pem = Some("-----BEGIN CERTIFICATE-----\n...".into());
        profile.skip_verify = true;

        let ctx = RemoteContext::prepare(tmp.path(), &profile).unwrap();
        assert!(ctx.config_path.exists());
        assert!(ctx.extra_args.iter().any(|a| a == "--ca-cert"));
        assert!(ctx.extra_args.iter().any(|a| a == "--no-check-certificate"));

        let paths: Vec<_> = std::iter::once(ctx.config_path.clone())
            .chain(ctx.tls_files.iter().cloned())
            .collect();
        ctx.cleanup();
        for p in paths {
            assert!(!p.exists(), "{} should be unlinked", p.display());
        }
    }

    #[test]
    fn remote_spec_joins_bucket_and_key() {
        assert_eq!(RemoteContext::remote_spec("b", ""), "target:b");
        assert_eq!(RemoteContext::remote_spec("b", "a/c.txt"), "target:b/a/c.txt");
    }
}
