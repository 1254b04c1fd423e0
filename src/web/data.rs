use sqlx::PgPool;

use super::auth::AuthUser;
use super::models::{ExportRow, ProjectRow};

const EXPORT_COLUMNS: &str = "e.id, e.title, e.status, e.file_path, e.checksum, \
     e.counters, e.task_filter_options, e.annotation_filter_options, e.serialization_options, \
     e.created_by, u.username AS created_by_username, e.created_at, e.finished_at";

/// Looks up a project the user is allowed to see. Admins see every project,
/// everyone else only projects of their own organization. A project outside
/// the caller's organization is indistinguishable from a missing one.
pub async fn fetch_project_for_user(
    pool: &PgPool,
    project_id: i64,
    user: &AuthUser,
) -> sqlx::Result<Option<ProjectRow>> {
    sqlx::query_as::<_, ProjectRow>(
        "SELECT id, title, created_at FROM projects \
         WHERE id = $1 AND (organization_id = $2 OR $3)",
    )
    .bind(project_id)
    .bind(user.organization_id)
    .bind(user.is_admin)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_exports(pool: &PgPool, project_id: i64) -> sqlx::Result<Vec<ExportRow>> {
    let sql = format!(
        "SELECT {EXPORT_COLUMNS} FROM exports e \
         LEFT JOIN users u ON u.id = e.created_by \
         WHERE e.project_id = $1 ORDER BY e.created_at DESC",
    );
    sqlx::query_as::<_, ExportRow>(&sql)
        .bind(project_id)
        .fetch_all(pool)
        .await
}

pub async fn fetch_export(
    pool: &PgPool,
    project_id: i64,
    export_id: i64,
) -> sqlx::Result<Option<ExportRow>> {
    let sql = format!(
        "SELECT {EXPORT_COLUMNS} FROM exports e \
         LEFT JOIN users u ON u.id = e.created_by \
         WHERE e.id = $1 AND e.project_id = $2",
    );
    sqlx::query_as::<_, ExportRow>(&sql)
        .bind(export_id)
        .bind(project_id)
        .fetch_optional(pool)
        .await
}
