use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
};
use axum_extra::extract::Query;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::AppState;
use crate::export::{self, ExportFormat, FormatDescriptor, LegacyExportFile};
use crate::export::snapshot::{
    self, AnnotationFilterOptions, SerializationOptions, TaskFilterOptions,
};
use crate::web::{
    ApiMessage,
    auth::{self, AuthUser},
    data,
    json_error,
    models::ProjectRow,
    storage,
};

pub mod jobs;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/projects/:project_id/export/formats", get(list_formats))
        .route("/api/projects/:project_id/export", get(download_tasks))
        .route("/api/projects/:project_id/export/files", get(list_legacy_files))
        .route("/api/auth/export", get(check_export_access))
        .merge(jobs::router())
}

/// GET /api/projects/:id/export/formats
async fn list_formats(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath(project_id): AxumPath<i64>,
) -> Result<Json<Vec<FormatDescriptor>>, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    require_project(&state, project_id, &user).await?;

    Ok(Json(export::format_descriptors()))
}

#[derive(Deserialize)]
struct SyncExportQuery {
    #[serde(rename = "exportType")]
    export_type: Option<String>,
    #[serde(rename = "export_type")]
    export_type_legacy: Option<String>,
    download_all_tasks: Option<String>,
    download_resources: Option<String>,
    #[serde(rename = "ids[]", default)]
    ids: Vec<i64>,
}

/// GET /api/projects/:id/export
///
/// Generates the export in-request and streams it back as an attachment. By
/// default only tasks that have annotations are included;
/// `download_all_tasks=true` lifts that restriction.
async fn download_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath(project_id): AxumPath<i64>,
    Query(query): Query<SyncExportQuery>,
) -> Result<Response, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let format = parse_format_param(
        query
            .export_type
            .as_deref()
            .or(query.export_type_legacy.as_deref()),
    )?;
    let download_all =
        parse_bool_param("download_all_tasks", query.download_all_tasks.as_deref())?
            .unwrap_or(false);
    let only_annotated = !download_all;
    let bundle_resources =
        parse_bool_param("download_resources", query.download_resources.as_deref())?
            .unwrap_or(state.config().download_resources);

    let pool = state.pool();
    let task_ids = snapshot::load_task_ids(
        &pool,
        project.id,
        &query.ids,
        only_annotated,
        &TaskFilterOptions::default(),
    )
    .await
    .map_err(|err| internal_error(err.into()))?;

    let tasks = snapshot::load_serialized_tasks(
        &pool,
        &task_ids,
        &AnnotationFilterOptions::default(),
        &SerializationOptions::default(),
    )
    .await
    .map_err(internal_error)?;

    let media_root = state.config().media_root.clone();
    let export_dir = state.config().export_dir.clone();
    let generated = tokio::task::spawn_blocking(move || {
        export::generate_export_file(
            &project,
            &tasks,
            format,
            bundle_resources,
            &media_root,
            &export_dir,
        )
    })
    .await
    .map_err(|err| internal_error(err.into()))?
    .map_err(internal_error)?;

    storage::attachment_response(generated.bytes, &generated.filename, generated.content_type)
}

#[derive(Serialize)]
struct LegacyFileListing {
    export_files: Vec<LegacyExportFile>,
}

/// GET /api/projects/:id/export/files
///
/// Lists flat snapshot files written by past on-demand exports, newest
/// first. The reverse proxy serves the actual bytes.
async fn list_legacy_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath(project_id): AxumPath<i64>,
) -> Result<Json<LegacyFileListing>, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let export_files = export::legacy_export_entries(
        state.config().legacy_export_dir(),
        project.id,
        &state.config().export_url_root,
    )
    .await
    .map_err(internal_error)?;

    Ok(Json(LegacyFileListing { export_files }))
}

/// GET /api/auth/export
///
/// Auth subrequest target for the reverse proxy: decides from
/// `X-Original-URI` whether the caller may fetch a flat export file.
async fn check_export_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(StatusCode, Json<ApiMessage>), (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;

    let Some(original_uri) = headers
        .get("x-original-uri")
        .and_then(|value| value.to_str().ok())
    else {
        return Err(incorrect_export_filename());
    };

    let Some(project_id) = project_id_from_original_uri(original_uri) else {
        return Err(incorrect_export_filename());
    };

    match data::fetch_project_for_user(state.pool_ref(), project_id, &user).await {
        Ok(Some(_)) => Ok((StatusCode::OK, Json(ApiMessage::new("auth ok")))),
        Ok(None) => Err(json_error(StatusCode::NOT_FOUND, "Project not found")),
        Err(err) => Err(internal_error(err.into())),
    }
}

/// Extracts the project id from the filename part of a proxied export URI.
/// The filename starts with the numeric project id up to the first dash.
fn project_id_from_original_uri(uri: &str) -> Option<i64> {
    let filename = uri.replace("/export/", "");
    export::project_id_prefix(&filename)
}

fn incorrect_export_filename() -> (StatusCode, Json<ApiMessage>) {
    json_error(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Incorrect filename in export",
    )
}

fn parse_format_param(
    value: Option<&str>,
) -> Result<ExportFormat, (StatusCode, Json<ApiMessage>)> {
    match value {
        None => Ok(ExportFormat::Json),
        Some(raw) => ExportFormat::from_param(raw).ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                format!("Unknown export format {raw}"),
            )
        }),
    }
}

/// Tolerant boolean parsing for query parameters, accepting the spellings
/// existing clients send.
fn bool_from_param(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "not" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_bool_param(
    name: &str,
    value: Option<&str>,
) -> Result<Option<bool>, (StatusCode, Json<ApiMessage>)> {
    match value {
        None => Ok(None),
        Some(raw) => bool_from_param(raw).map(Some).ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                format!("Incorrect value in {name}: {raw}"),
            )
        }),
    }
}

pub(super) async fn require_project(
    state: &AppState,
    project_id: i64,
    user: &AuthUser,
) -> Result<ProjectRow, (StatusCode, Json<ApiMessage>)> {
    match data::fetch_project_for_user(state.pool_ref(), project_id, user).await {
        Ok(Some(project)) => Ok(project),
        Ok(None) => Err(json_error(StatusCode::NOT_FOUND, "Project not found")),
        Err(err) => Err(internal_error(err.into())),
    }
}

pub(super) fn internal_error(err: anyhow::Error) -> (StatusCode, Json<ApiMessage>) {
    error!(?err, "internal error in exports module");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiMessage::new("Internal server error")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_params_accept_client_spellings() {
        for raw in ["true", "YES", "on", "1"] {
            assert_eq!(bool_from_param(raw), Some(true), "{raw}");
        }
        for raw in ["false", "no", "not", "OFF", "0"] {
            assert_eq!(bool_from_param(raw), Some(false), "{raw}");
        }
        assert_eq!(bool_from_param("2"), None);
        assert_eq!(bool_from_param(""), None);
    }

    #[test]
    fn invalid_bool_param_is_a_bad_request() {
        let err = parse_bool_param("download_all_tasks", Some("sometimes")).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(
            parse_bool_param("download_all_tasks", None).unwrap(),
            None
        );
    }

    #[test]
    fn format_param_defaults_to_json() {
        assert_eq!(parse_format_param(None).unwrap(), ExportFormat::Json);
        assert_eq!(
            parse_format_param(Some("tsv")).unwrap(),
            ExportFormat::Tsv
        );
        let err = parse_format_param(Some("PARQUET")).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn project_id_comes_from_proxied_filename() {
        assert_eq!(
            project_id_from_original_uri("/export/5-2025-03-01-10-30-abcd1234.json"),
            Some(5)
        );
        assert_eq!(project_id_from_original_uri("/export/readme.json"), None);
        assert_eq!(project_id_from_original_uri("/other/5-x.json"), None);
        assert_eq!(project_id_from_original_uri(""), None);
    }
}
