//! Download routes
//!
//! Serves files from the backing store with byte-range support, and
//! directories as streamed zip archives.

use std::io::SeekFrom;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::download::{parse_range, zip_stream, ByteRange};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::storage::{base_name, FileInfo};

/// Create the download router. `GET` also answers `HEAD`.
pub fn router() -> Router<AppState> {
    Router::new().route("/*path", get(download))
}

async fn download(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let info = state.store().stat(&path).await?;

    if info.is_dir {
        serve_directory(&state, &path).await
    } else {
        serve_file(&state, &path, &info, &headers).await
    }
}

/// Stream a directory as `<name>.zip`
async fn serve_directory(state: &AppState, path: &str) -> Result<Response> {
    let name = base_name(path).to_string();
    let reader = state.store().archive(path).await?;

    tracing::info!(path, "Streaming directory archive");

    let body = Body::from_stream(zip_stream(reader, name.clone()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            attachment(&format!("{}.zip", name)),
        )
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Serve a single file, honouring one `Range` if present
async fn serve_file(
    state: &AppState,
    path: &str,
    info: &FileInfo,
    headers: &HeaderMap,
) -> Result<Response> {
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = parse_range(range_header, info.size);

    let (status, start, len) = match range {
        ByteRange::Full => (StatusCode::OK, 0, info.size),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        ByteRange::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_RANGE, format!("bytes */{}", info.size))
                .body(Body::empty())
                .map_err(|e| AppError::Internal(e.to_string()));
        }
    };

    let mut reader = state.store().open(path).await?;
    if start > 0 {
        reader.seek(SeekFrom::Start(start)).await?;
    }

    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, attachment(&info.name));

    if let Some(content_range) = range.content_range(info.size) {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    if let Some(modified) = info.modified {
        builder = builder.header(header::LAST_MODIFIED, http_date(modified));
    }

    let body = Body::from_stream(ReaderStream::new(reader.take(len)));

    builder
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// `Content-Disposition` value forcing a download
fn attachment(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"",
        filename.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::io::Read;
    use tower::ServiceExt;

    use crate::config::Config;

    fn test_app(temp: &tempfile::TempDir) -> Router {
        let mut config = Config::default();
        config.storage.root = temp.path().join("store");
        config.storage.staging_dir = temp.path().join("staging");

        crate::app(AppState::from_config(config).unwrap())
    }

    fn get(uri: &str, range: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(range) = range {
            builder = builder.header("range", range);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn write(temp: &tempfile::TempDir, path: &str, data: &[u8]) {
        let full = temp.path().join("store").join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, data).unwrap();
    }

    #[tokio::test]
    async fn test_full_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = test_app(&temp);
        write(&temp, "books/notes.txt", b"hello world");

        let response = app.oneshot(get("/download/books/notes.txt", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"notes.txt\""
        );
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert!(response.headers().contains_key(header::LAST_MODIFIED));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_partial_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = test_app(&temp);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        write(&temp, "blob.bin", &data);

        let response = app
            .oneshot(get("/download/blob.bin", Some("bytes=1000-1999")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes 1000-1999/5000"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &data[1000..2000]);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = test_app(&temp);
        write(&temp, "small.bin", b"abc");

        let response = app
            .oneshot(get("/download/small.bin", Some("bytes=10-20")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */3");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = test_app(&temp);

        let response = app.oneshot(get("/download/nope.bin", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_directory_zip() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = test_app(&temp);
        write(&temp, "test/one/a.txt", b"alpha");
        write(&temp, "test/two/b.txt", b"bravo");

        let response = app.oneshot(get("/download/test", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"test.zip\""
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body.to_vec())).unwrap();
        assert_eq!(archive.len(), 2);

        let mut names: Vec<String> = archive
            .file_names()
            .map(|name| name.unwrap().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["test/one/a.txt", "test/two/b.txt"]);

        let mut contents = String::new();
        archive
            .by_name("test/two/b.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "bravo");
    }

    #[test]
    fn test_attachment_escaping() {
        assert_eq!(attachment("a\"b.txt"), "attachment; filename=\"a\\\"b.txt\"");
    }
}
