use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Clone, FromRow)]
pub struct ProjectRow {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Export row joined with the creator's username, which every API
/// representation of an export needs.
#[derive(Clone, FromRow)]
pub struct ExportRow {
    pub id: i64,
    pub title: String,
    pub status: String,
    pub file_path: Option<String>,
    pub checksum: Option<String>,
    pub counters: Value,
    pub task_filter_options: Option<Value>,
    pub annotation_filter_options: Option<Value>,
    pub serialization_options: Option<Value>,
    pub created_by: Option<Uuid>,
    pub created_by_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
