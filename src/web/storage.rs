use std::path::Path;

use axum::Json;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::web::{ApiMessage, json_error};

/// Bare header carrying the artifact filename, kept alongside the standard
/// disposition because older client scripts read it directly.
const FILENAME_HEADER: HeaderName = HeaderName::from_static("filename");

/// Serve an in-memory artifact with a standard attachment disposition.
pub fn attachment_response(
    bytes: Vec<u8>,
    filename: &str,
    content_type: &str,
) -> Result<Response, (StatusCode, Json<ApiMessage>)> {
    let headers = attachment_headers(filename, content_type)?;
    Ok((headers, bytes).into_response())
}

/// Stream a file from disk with a standard attachment disposition.
pub async fn stream_file(
    path: &Path,
    filename: &str,
    content_type: &str,
) -> Result<Response, (StatusCode, Json<ApiMessage>)> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        error!(?err, file = %path.display(), "failed to read download file");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read export file")
    })?;

    let headers = attachment_headers(filename, content_type)?;
    Ok((headers, bytes).into_response())
}

fn attachment_headers(
    filename: &str,
    content_type: &str,
) -> Result<HeaderMap, (StatusCode, Json<ApiMessage>)> {
    let safe_name = sanitize_filename::sanitize(filename);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .map_err(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid content type"))?,
    );
    let disposition = format!("attachment; filename=\"{safe_name}\"");
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(|_| {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid download header")
        })?,
    );
    headers.insert(
        FILENAME_HEADER,
        HeaderValue::from_str(&safe_name).map_err(|_| {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid download header")
        })?,
    );

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_disposition_and_filename() {
        let headers = attachment_headers("project-1-at-2025-03-01-10-30-abcd1234.json", "application/json")
            .unwrap();
        assert_eq!(
            headers.get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"project-1-at-2025-03-01-10-30-abcd1234.json\""
        );
        assert_eq!(
            headers.get("filename").unwrap(),
            "project-1-at-2025-03-01-10-30-abcd1234.json"
        );
    }

    #[test]
    fn hostile_filenames_lose_their_path_separators() {
        let headers = attachment_headers("../../etc/passwd", "application/json").unwrap();
        let value = headers.get("filename").unwrap().to_str().unwrap();
        assert!(!value.contains('/'));
        assert!(!value.contains('\\'));
        assert!(!value.is_empty());

        let headers = attachment_headers("..\\..\\boot.ini", "application/json").unwrap();
        let value = headers.get("filename").unwrap().to_str().unwrap();
        assert!(!value.contains('/'));
        assert!(!value.contains('\\'));
        assert!(!value.is_empty());
    }
}
