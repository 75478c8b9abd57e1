use axum::body::{boxed, Bytes, Full};
use axum::extract::{Multipart, Path, Query};
use axum::http::header;
use axum::response::Response;
use axum::Extension;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::fs;
use uuid::Uuid;

use crate::auth::authenticate;
use crate::config::CONFIG;
use crate::err::Error;
use crate::{breaks, proceeds, Payload};

pub async fn prepare_upload_dir() -> anyhow::Result<()> {
    fs::create_dir_all(&CONFIG.upload_dir).await?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadQuery {
    pub ssid: String,
    /// "profile" or "course-material"; echoed back, not interpreted.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Uploaded {
    pub url: String,
    pub filename: String,
    pub kind: Option<String>,
}

/// Single-shot transfer: size-checked, written once, no retry and no
/// chunking. Persisting the returned URL onto a profile or course is the
/// caller's second step.
pub async fn upload(
    Query(q): Query<UploadQuery>,
    Extension(pg): Extension<PgPool>,
    mut multipart: Multipart,
) -> Payload<Uploaded> {
    authenticate(&q.ssid, &pg).await?;

    let field = multipart
        .next_field()
        .await
        .map_err(|err| Error::invalid(format!("Malformed upload: {}", err)))?;
    let field = match field {
        Some(field) => field,
        None => return breaks(Error::invalid("No file was attached")),
    };

    let filename = sanitize(field.file_name().unwrap_or("upload.bin"));
    let bytes = field
        .bytes()
        .await
        .map_err(|err| Error::invalid(format!("Upload transfer failed: {}", err)))?;

    if bytes.len() as u64 > CONFIG.max_upload_bytes() {
        return breaks(Error::PayloadTooLarge {
            message: format!("File size must be less than {}MB", CONFIG.max_upload_mb),
        });
    }

    let stored = format!("{}-{}", Uuid::new_v4().simple(), filename);
    fs::write(CONFIG.upload_dir.join(&stored), &bytes).await?;
    log::info!("Stored upload {} ({} bytes)", stored, bytes.len());

    proceeds(Uploaded {
        url: format!("/files/{}", stored),
        filename,
        kind: q.kind,
    })
}

pub async fn serve(Path(name): Path<String>) -> Result<Response, Error> {
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(Error::NotFound {
            message: format!("Invalid file name: {}", name),
        });
    }

    let path = CONFIG.upload_dir.join(&name);
    let body = fs::read(&path).await.map_err(|_| Error::NotFound {
        message: format!("No such file: {}", name),
    })?;

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(boxed(Full::new(Bytes::from(body))))
        .map_err(|err| Error::InternalError {
            kind: "HTTPError",
            message: err.to_string(),
        })
}

fn sanitize(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_paths_and_oddities() {
        assert_eq!(sanitize("photo.png"), "photo.png");
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\Users\\me\\pic.jpg"), "pic.jpg");
        assert_eq!(sanitize("my file (1).pdf"), "my_file__1_.pdf");
        assert_eq!(sanitize(""), "upload.bin");
    }
}
