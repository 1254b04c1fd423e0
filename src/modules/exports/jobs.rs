use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query as AxumQuery, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs as tokio_fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{internal_error, require_project};
use crate::AppState;
use crate::export::snapshot::{
    self, AnnotationFilterOptions, SerializationOptions, TaskFilterOptions,
};
use crate::export::{self, ExportFormat};
use crate::web::{
    ApiMessage, auth, data, json_error,
    models::{ExportRow, ProjectRow},
    responses::text_not_found,
    status::ExportStatus,
    storage,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/projects/:project_id/exports",
            get(list_exports).post(create_export),
        )
        .route(
            "/api/projects/:project_id/exports/:export_id",
            get(get_export).delete(delete_export),
        )
        .route(
            "/api/projects/:project_id/exports/:export_id/download",
            get(download_export),
        )
}

/// GET /api/projects/:id/exports
async fn list_exports(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath(project_id): AxumPath<i64>,
) -> Result<Json<Vec<ExportResponse>>, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let rows = data::fetch_exports(state.pool_ref(), project.id)
        .await
        .map_err(|err| internal_error(err.into()))?;

    Ok(Json(rows.into_iter().map(export_response).collect()))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ExportCreatePayload {
    title: Option<String>,
    task_filter_options: Option<TaskFilterOptions>,
    annotation_filter_options: Option<AnnotationFilterOptions>,
    serialization_options: Option<SerializationOptions>,
}

/// POST /api/projects/:id/exports
///
/// Registers a snapshot job and kicks off generation in the background.
/// Responds right away with the new record; clients poll it until the status
/// leaves `in_progress`.
async fn create_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath(project_id): AxumPath<i64>,
    Json(payload): Json<ExportCreatePayload>,
) -> Result<(StatusCode, Json<ExportCreateResponse>), (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let pool = state.pool();

    let title = payload
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_export_title(&project.title, &Utc::now()));

    let task_filters = payload.task_filter_options.unwrap_or_default();
    let annotation_filters = payload.annotation_filter_options.unwrap_or_default();
    let serialization = payload.serialization_options.unwrap_or_default();

    let task_filter_value = option_value(payload.task_filter_options)?;
    let annotation_filter_value = option_value(payload.annotation_filter_options)?;
    let serialization_value = option_value(payload.serialization_options)?;

    // The partial unique index on active exports arbitrates concurrent
    // requests; whoever inserts second gets the violation.
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO exports (project_id, title, status, task_filter_options, annotation_filter_options, serialization_options, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
    )
    .bind(project.id)
    .bind(&title)
    .bind(ExportStatus::Created.as_str())
    .bind(&task_filter_value)
    .bind(&annotation_filter_value)
    .bind(&serialization_value)
    .bind(user.id)
    .fetch_one(&pool)
    .await;

    let export_id = match inserted {
        Ok(id) => id,
        Err(err) if is_unique_violation(&err) => {
            warn!(project_id = project.id, "refusing concurrent export for project");
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Export is already in progress for this project",
            ));
        }
        Err(err) => return Err(internal_error(err.into())),
    };

    sqlx::query("UPDATE exports SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(export_id)
        .bind(ExportStatus::InProgress.as_str())
        .execute(&pool)
        .await
        .map_err(|err| internal_error(err.into()))?;

    // Fetched after the flip so the response already shows `in_progress`.
    let row = data::fetch_export(&pool, project.id, export_id)
        .await
        .map_err(|err| internal_error(err.into()))?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Export not found"))?;

    spawn_export_worker(
        state.clone(),
        export_id,
        project,
        task_filters,
        annotation_filters,
        serialization,
    );

    Ok((StatusCode::CREATED, Json(export_create_response(row))))
}

/// A second active export for the same project trips the partial unique
/// index on `exports (project_id)`.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation),
        _ => false,
    }
}

/// GET /api/projects/:id/exports/:export_id
async fn get_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath((project_id, export_id)): AxumPath<(i64, i64)>,
) -> Result<Json<ExportResponse>, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let row = data::fetch_export(state.pool_ref(), project.id, export_id)
        .await
        .map_err(|err| internal_error(err.into()))?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Export not found"))?;

    Ok(Json(export_response(row)))
}

/// DELETE /api/projects/:id/exports/:export_id
///
/// Removes the record and its on-disk artifacts. Artifact removal is best
/// effort; a file that is already gone does not fail the request.
async fn delete_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath((project_id, export_id)): AxumPath<(i64, i64)>,
) -> Result<StatusCode, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let row = data::fetch_export(state.pool_ref(), project.id, export_id)
        .await
        .map_err(|err| internal_error(err.into()))?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Export not found"))?;

    if let Some(file_path) = &row.file_path {
        remove_artifacts(Path::new(file_path)).await;
    }

    sqlx::query("DELETE FROM exports WHERE id = $1")
        .bind(row.id)
        .execute(state.pool_ref())
        .await
        .map_err(|err| internal_error(err.into()))?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(rename = "exportType")]
    export_type: Option<String>,
}

/// GET /api/projects/:id/exports/:export_id/download
///
/// Streams the stored snapshot, converting it on the fly when `exportType`
/// asks for another format. Converted files are cached next to the snapshot.
/// The not-found bodies here are plain text because existing download
/// tooling matches on them.
async fn download_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    AxumPath((project_id, export_id)): AxumPath<(i64, i64)>,
    AxumQuery(query): AxumQuery<DownloadQuery>,
) -> Result<Response, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user(&state, &headers, &jar).await?;
    let project = require_project(&state, project_id, &user).await?;

    let row = data::fetch_export(state.pool_ref(), project.id, export_id)
        .await
        .map_err(|err| internal_error(err.into()))?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Export not found"))?;

    if !ExportStatus::from_str(&row.status).is_completed() {
        return Ok(text_not_found("Export is not completed"));
    }

    let format = match query.export_type.as_deref() {
        None => ExportFormat::Json,
        Some(raw) => match ExportFormat::from_param(raw) {
            Some(format) => format,
            None => return Ok(text_not_found("Can't get file")),
        },
    };

    let Some(file_path) = row.file_path else {
        return Ok(text_not_found("Can't get file"));
    };

    let snapshot_path = PathBuf::from(file_path);
    let converted =
        tokio::task::spawn_blocking(move || export::convert_snapshot(&snapshot_path, format))
            .await
            .map_err(|err| internal_error(err.into()))?;

    let (path, filename) = match converted {
        Ok(result) => result,
        Err(err) => {
            error!(?err, export_id, "failed to prepare export download");
            return Ok(text_not_found("Can't get file"));
        }
    };

    storage::stream_file(&path, &filename, format.content_type()).await
}

fn default_export_title(project_title: &str, moment: &chrono::DateTime<Utc>) -> String {
    let mut slug = project_title.trim().replace(' ', "-");
    if slug.is_empty() {
        slug = "project".to_string();
    }
    format!("{slug}-at-{}", export::timestamp_slug(moment))
}

fn option_value<T: Serialize>(
    options: Option<T>,
) -> Result<Option<Value>, (StatusCode, Json<ApiMessage>)> {
    options
        .map(|options| serde_json::to_value(options))
        .transpose()
        .map_err(|err| internal_error(err.into()))
}

/// Every file a finished export may have on disk: the snapshot itself plus
/// any cached conversions.
fn artifact_paths(snapshot_path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![snapshot_path.to_path_buf()];
    for format in export::EXPORT_FORMATS {
        let sibling = export::converted_path(snapshot_path, format);
        if !paths.contains(&sibling) {
            paths.push(sibling);
        }
    }
    paths
}

async fn remove_artifacts(snapshot_path: &Path) {
    for path in artifact_paths(snapshot_path) {
        match tokio_fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(?err, file = %path.display(), "failed to remove export artifact");
            }
        }
    }
}

fn spawn_export_worker(
    state: AppState,
    export_id: i64,
    project: ProjectRow,
    task_filters: TaskFilterOptions,
    annotation_filters: AnnotationFilterOptions,
    serialization: SerializationOptions,
) {
    tokio::spawn(async move {
        if let Err(err) = process_export(
            &state,
            export_id,
            &project,
            &task_filters,
            &annotation_filters,
            &serialization,
        )
        .await
        {
            error!(?err, export_id, "export job failed");
            let pool = state.pool();
            if let Err(update_err) =
                sqlx::query("UPDATE exports SET status = $2, updated_at = NOW() WHERE id = $1")
                    .bind(export_id)
                    .bind(ExportStatus::Failed.as_str())
                    .execute(&pool)
                    .await
            {
                error!(?update_err, export_id, "failed to update export after error");
            }
        }
    });
}

async fn process_export(
    state: &AppState,
    export_id: i64,
    project: &ProjectRow,
    task_filters: &TaskFilterOptions,
    annotation_filters: &AnnotationFilterOptions,
    serialization: &SerializationOptions,
) -> Result<()> {
    let pool = state.pool();

    let task_ids = snapshot::load_task_ids(&pool, project.id, &[], false, task_filters)
        .await
        .context("failed to select tasks for snapshot")?;
    let tasks =
        snapshot::load_serialized_tasks(&pool, &task_ids, annotation_filters, serialization)
            .await?;

    let bytes = export::render_tasks(ExportFormat::Json, &tasks)?;
    let checksum = export::checksum_hex(&bytes);
    let mut digest = checksum.clone();
    digest.truncate(8);

    let dir = state.config().project_export_dir(project.id);
    tokio_fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create snapshot directory {}", dir.display()))?;

    let filename = format!(
        "{}.json",
        export::export_basename(project.id, &Utc::now(), &digest)
    );
    let path = dir.join(&filename);
    tokio_fs::write(&path, &bytes)
        .await
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;

    let counters = json!({ "task_number": task_ids.len() });

    sqlx::query(
        "UPDATE exports SET status = $2, file_path = $3, checksum = $4, counters = $5, finished_at = NOW(), updated_at = NOW() WHERE id = $1",
    )
    .bind(export_id)
    .bind(ExportStatus::Completed.as_str())
    .bind(path.to_string_lossy().to_string())
    .bind(&checksum)
    .bind(&counters)
    .execute(&pool)
    .await
    .context("failed to finalize export record")?;

    info!(
        export_id,
        project_id = project.id,
        tasks = task_ids.len(),
        "export snapshot completed"
    );
    Ok(())
}

fn export_response(row: ExportRow) -> ExportResponse {
    let created_by = row.created_by.map(|id| UserBrief {
        id,
        username: row.created_by_username.clone(),
    });

    ExportResponse {
        id: row.id,
        title: row.title,
        status: ExportStatus::from_str(&row.status),
        checksum: row.checksum,
        counters: row.counters,
        created_by,
        created_at: row.created_at.to_rfc3339(),
        finished_at: row.finished_at.map(|at| at.to_rfc3339()),
    }
}

fn export_create_response(row: ExportRow) -> ExportCreateResponse {
    let task_filter_options = row.task_filter_options.clone();
    let annotation_filter_options = row.annotation_filter_options.clone();
    let serialization_options = row.serialization_options.clone();

    ExportCreateResponse {
        export: export_response(row),
        task_filter_options,
        annotation_filter_options,
        serialization_options,
    }
}

#[derive(Serialize)]
struct UserBrief {
    id: Uuid,
    username: Option<String>,
}

#[derive(Serialize)]
struct ExportResponse {
    id: i64,
    title: String,
    status: ExportStatus,
    checksum: Option<String>,
    counters: Value,
    created_by: Option<UserBrief>,
    created_at: String,
    finished_at: Option<String>,
}

#[derive(Serialize)]
struct ExportCreateResponse {
    #[serde(flatten)]
    export: ExportResponse,
    task_filter_options: Option<Value>,
    annotation_filter_options: Option<Value>,
    serialization_options: Option<Value>,
}
