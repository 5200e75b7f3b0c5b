//! Direct-mode ingest: stream a body straight through the engine to the
//! remote, no server-side staging.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use bucketd_core::models::Profile;
use bucketd_engine::{Engine, EngineError, RemoteContext};

use crate::UploadError;

pub(crate) async fn rcat(
    engine: &Engine,
    tmp_root: &std::path::Path,
    profile: &Profile,
    bucket: &str,
    key: &str,
    data: &[u8],
) -> Result<(), UploadError> {
    let rc = RemoteContext::prepare(tmp_root, profile)?;
    let spec = RemoteContext::remote_spec(bucket, key);
    let mut child = engine.start(rc, &["rcat", &spec], true)?;

    let mut stdin = child
        .stdin()
        .ok_or_else(|| UploadError::InvalidRequest("engine stdin not captured".into()))?;
    let stderr = child.stderr();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    });

    stdin.write_all(data).await?;
    stdin.shutdown().await?;
    drop(stdin);

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(UploadError::Engine(EngineError::Exit {
            code: status.code().unwrap_or(-1),
            stderr: stderr_task.await.unwrap_or_default(),
        }))
    }
}
