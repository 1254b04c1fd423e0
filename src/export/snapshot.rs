use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Tasks are hydrated in slices of this size so that a huge project never
/// pulls every annotation row into memory at once.
pub const SERIALIZATION_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Which tasks end up in a snapshot. Each field is a tri-state: absent means
/// the dimension is ignored.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFilterOptions {
    pub skipped: Option<FilterMode>,
    pub finished: Option<FilterMode>,
    pub annotated: Option<FilterMode>,
}

/// Which annotations of a selected task are serialized. Enabled fields are
/// OR-ed together; all-false keeps every annotation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationFilterOptions {
    pub usual: bool,
    pub ground_truth: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationOption {
    pub only_id: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationOptions {
    pub predictions: RelationOption,
    pub completed_by: RelationOption,
}

/// Builds the id-selection query for one project. `$1` is the project id,
/// `$2` an explicit id allowlist (empty array selects everything).
pub fn task_filter_sql(only_annotated: bool, filters: &TaskFilterOptions) -> String {
    let mut sql = String::from(
        "SELECT id FROM tasks WHERE project_id = $1 \
         AND (cardinality($2::bigint[]) = 0 OR id = ANY($2))",
    );

    if only_annotated {
        sql.push_str(" AND EXISTS (SELECT 1 FROM annotations a WHERE a.task_id = tasks.id)");
    }

    match filters.finished {
        Some(FilterMode::Include) => sql.push_str(" AND tasks.is_labeled"),
        Some(FilterMode::Exclude) => sql.push_str(" AND NOT tasks.is_labeled"),
        None => {}
    }

    match filters.skipped {
        Some(FilterMode::Include) => sql.push_str(
            " AND EXISTS (SELECT 1 FROM annotations a WHERE a.task_id = tasks.id AND a.was_cancelled)",
        ),
        Some(FilterMode::Exclude) => sql.push_str(
            " AND NOT EXISTS (SELECT 1 FROM annotations a WHERE a.task_id = tasks.id AND a.was_cancelled)",
        ),
        None => {}
    }

    match filters.annotated {
        Some(FilterMode::Include) => sql.push_str(
            " AND EXISTS (SELECT 1 FROM annotations a WHERE a.task_id = tasks.id AND NOT a.was_cancelled)",
        ),
        Some(FilterMode::Exclude) => sql.push_str(
            " AND NOT EXISTS (SELECT 1 FROM annotations a WHERE a.task_id = tasks.id AND NOT a.was_cancelled)",
        ),
        None => {}
    }

    sql.push_str(" ORDER BY id");
    sql
}

/// WHERE fragment selecting annotations by kind, or `None` when no filter
/// applies.
pub fn annotation_filter_sql(filters: &AnnotationFilterOptions) -> Option<String> {
    let mut conditions: Vec<&str> = Vec::new();
    if filters.usual {
        conditions.push("(NOT a.was_cancelled AND NOT a.ground_truth)");
    }
    if filters.ground_truth {
        conditions.push("a.ground_truth");
    }
    if filters.skipped {
        conditions.push("a.was_cancelled");
    }

    if conditions.is_empty() {
        None
    } else {
        Some(format!("({})", conditions.join(" OR ")))
    }
}

pub async fn load_task_ids(
    pool: &PgPool,
    project_id: i64,
    requested_ids: &[i64],
    only_annotated: bool,
    filters: &TaskFilterOptions,
) -> sqlx::Result<Vec<i64>> {
    let sql = task_filter_sql(only_annotated, filters);
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(project_id)
        .bind(requested_ids)
        .fetch_all(pool)
        .await
}

/// Hydrates tasks with their annotations and predictions, batch by batch,
/// and returns them as ready-to-write JSON objects.
pub async fn load_serialized_tasks(
    pool: &PgPool,
    task_ids: &[i64],
    annotation_filters: &AnnotationFilterOptions,
    options: &SerializationOptions,
) -> Result<Vec<Value>> {
    let mut tasks = Vec::with_capacity(task_ids.len());

    for chunk in task_ids.chunks(SERIALIZATION_BATCH_SIZE) {
        let task_rows = fetch_task_rows(pool, chunk)
            .await
            .context("failed to load task batch")?;
        let annotation_rows = fetch_annotation_rows(pool, chunk, annotation_filters)
            .await
            .context("failed to load annotation batch")?;
        let prediction_rows = fetch_prediction_rows(pool, chunk)
            .await
            .context("failed to load prediction batch")?;

        let mut annotations_by_task: HashMap<i64, Vec<Value>> = HashMap::new();
        for row in annotation_rows {
            let rendered = render_annotation(&row, options);
            annotations_by_task.entry(row.task_id).or_default().push(rendered);
        }

        let mut predictions_by_task: HashMap<i64, Vec<Value>> = HashMap::new();
        for row in prediction_rows {
            let rendered = render_prediction(&row, options);
            predictions_by_task.entry(row.task_id).or_default().push(rendered);
        }

        for row in task_rows {
            let mut task = Map::new();
            task.insert("id".to_string(), Value::from(row.id));
            task.insert("data".to_string(), row.data);
            task.insert("meta".to_string(), row.meta.unwrap_or(Value::Null));
            task.insert("is_labeled".to_string(), Value::from(row.is_labeled));
            task.insert("created_at".to_string(), Value::from(row.created_at.to_rfc3339()));
            task.insert("updated_at".to_string(), Value::from(row.updated_at.to_rfc3339()));
            task.insert(
                "annotations".to_string(),
                Value::from(annotations_by_task.remove(&row.id).unwrap_or_default()),
            );
            task.insert(
                "predictions".to_string(),
                Value::from(predictions_by_task.remove(&row.id).unwrap_or_default()),
            );
            tasks.push(Value::Object(task));
        }
    }

    Ok(tasks)
}

/// Flattens serialized tasks into one record per annotation, with the task
/// data fields spread at the top level. Tasks without annotations drop out.
pub fn json_min_records(tasks: &[Value]) -> Vec<Value> {
    let mut records = Vec::new();

    for task in tasks {
        let Some(annotations) = task.get("annotations").and_then(Value::as_array) else {
            continue;
        };

        for annotation in annotations {
            let mut record = Map::new();
            if let Some(data) = task.get("data").and_then(Value::as_object) {
                for (key, value) in data {
                    record.insert(key.clone(), value.clone());
                }
            }

            record.insert("id".to_string(), task.get("id").cloned().unwrap_or(Value::Null));
            record.insert(
                "annotation_id".to_string(),
                annotation.get("id").cloned().unwrap_or(Value::Null),
            );
            record.insert(
                "annotator".to_string(),
                annotator_label(annotation.get("completed_by")),
            );
            record.insert(
                "result".to_string(),
                annotation.get("result").cloned().unwrap_or(Value::Null),
            );
            record.insert(
                "lead_time".to_string(),
                annotation.get("lead_time").cloned().unwrap_or(Value::Null),
            );
            record.insert(
                "created_at".to_string(),
                annotation.get("created_at").cloned().unwrap_or(Value::Null),
            );
            record.insert(
                "updated_at".to_string(),
                annotation.get("updated_at").cloned().unwrap_or(Value::Null),
            );
            records.push(Value::Object(record));
        }
    }

    records
}

fn annotator_label(completed_by: Option<&Value>) -> Value {
    match completed_by {
        Some(Value::Object(user)) => user
            .get("username")
            .or_else(|| user.get("id"))
            .cloned()
            .unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn render_annotation(row: &AnnotationRow, options: &SerializationOptions) -> Value {
    let completed_by = match (row.completed_by, options.completed_by.only_id) {
        (None, _) => Value::Null,
        (Some(id), true) => Value::from(id.to_string()),
        (Some(id), false) => {
            let mut user = Map::new();
            user.insert("id".to_string(), Value::from(id.to_string()));
            user.insert(
                "username".to_string(),
                row.completed_by_username
                    .clone()
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            );
            Value::Object(user)
        }
    };

    let mut annotation = Map::new();
    annotation.insert("id".to_string(), Value::from(row.id));
    annotation.insert("completed_by".to_string(), completed_by);
    annotation.insert("result".to_string(), row.result.clone());
    annotation.insert("was_cancelled".to_string(), Value::from(row.was_cancelled));
    annotation.insert("ground_truth".to_string(), Value::from(row.ground_truth));
    annotation.insert(
        "lead_time".to_string(),
        row.lead_time.map(Value::from).unwrap_or(Value::Null),
    );
    annotation.insert("created_at".to_string(), Value::from(row.created_at.to_rfc3339()));
    annotation.insert("updated_at".to_string(), Value::from(row.updated_at.to_rfc3339()));
    Value::Object(annotation)
}

fn render_prediction(row: &PredictionRow, options: &SerializationOptions) -> Value {
    if options.predictions.only_id {
        return Value::from(row.id);
    }

    let mut prediction = Map::new();
    prediction.insert("id".to_string(), Value::from(row.id));
    prediction.insert(
        "model_version".to_string(),
        row.model_version.clone().map(Value::from).unwrap_or(Value::Null),
    );
    prediction.insert(
        "score".to_string(),
        row.score.map(Value::from).unwrap_or(Value::Null),
    );
    prediction.insert("result".to_string(), row.result.clone());
    prediction.insert("created_at".to_string(), Value::from(row.created_at.to_rfc3339()));
    Value::Object(prediction)
}

async fn fetch_task_rows(pool: &PgPool, task_ids: &[i64]) -> sqlx::Result<Vec<TaskRow>> {
    sqlx::query_as::<_, TaskRow>(
        "SELECT id, data, meta, is_labeled, created_at, updated_at FROM tasks \
         WHERE id = ANY($1) ORDER BY id",
    )
    .bind(task_ids)
    .fetch_all(pool)
    .await
}

async fn fetch_annotation_rows(
    pool: &PgPool,
    task_ids: &[i64],
    filters: &AnnotationFilterOptions,
) -> sqlx::Result<Vec<AnnotationRow>> {
    let mut sql = String::from(
        "SELECT a.id, a.task_id, a.completed_by, u.username AS completed_by_username, \
         a.result, a.was_cancelled, a.ground_truth, a.lead_time, a.created_at, a.updated_at \
         FROM annotations a LEFT JOIN users u ON u.id = a.completed_by \
         WHERE a.task_id = ANY($1)",
    );
    if let Some(condition) = annotation_filter_sql(filters) {
        sql.push_str(" AND ");
        sql.push_str(&condition);
    }
    sql.push_str(" ORDER BY a.task_id, a.id");

    sqlx::query_as::<_, AnnotationRow>(&sql)
        .bind(task_ids)
        .fetch_all(pool)
        .await
}

async fn fetch_prediction_rows(pool: &PgPool, task_ids: &[i64]) -> sqlx::Result<Vec<PredictionRow>> {
    sqlx::query_as::<_, PredictionRow>(
        "SELECT id, task_id, model_version, score, result, created_at FROM predictions \
         WHERE task_id = ANY($1) ORDER BY task_id, id",
    )
    .bind(task_ids)
    .fetch_all(pool)
    .await
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    data: Value,
    meta: Option<Value>,
    is_labeled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AnnotationRow {
    id: i64,
    task_id: i64,
    completed_by: Option<Uuid>,
    completed_by_username: Option<String>,
    result: Value,
    was_cancelled: bool,
    ground_truth: bool,
    lead_time: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PredictionRow {
    id: i64,
    task_id: i64,
    model_version: Option<String>,
    score: Option<f64>,
    result: Value,
    created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_query_has_no_extra_conditions() {
        let sql = task_filter_sql(false, &TaskFilterOptions::default());
        assert!(sql.starts_with("SELECT id FROM tasks WHERE project_id = $1"));
        assert!(!sql.contains("is_labeled"));
        assert!(!sql.contains("was_cancelled"));
        assert!(sql.ends_with("ORDER BY id"));
    }

    #[test]
    fn only_annotated_adds_exists_clause() {
        let sql = task_filter_sql(true, &TaskFilterOptions::default());
        assert!(sql.contains("EXISTS (SELECT 1 FROM annotations a WHERE a.task_id = tasks.id)"));
    }

    #[test]
    fn finished_filter_uses_is_labeled_flag() {
        let include = task_filter_sql(
            false,
            &TaskFilterOptions {
                finished: Some(FilterMode::Include),
                ..Default::default()
            },
        );
        assert!(include.contains("AND tasks.is_labeled"));

        let exclude = task_filter_sql(
            false,
            &TaskFilterOptions {
                finished: Some(FilterMode::Exclude),
                ..Default::default()
            },
        );
        assert!(exclude.contains("AND NOT tasks.is_labeled"));
    }

    #[test]
    fn skipped_exclude_negates_subquery() {
        let sql = task_filter_sql(
            false,
            &TaskFilterOptions {
                skipped: Some(FilterMode::Exclude),
                ..Default::default()
            },
        );
        assert!(sql.contains("NOT EXISTS"));
        assert!(sql.contains("a.was_cancelled"));
    }

    #[test]
    fn annotation_filter_is_a_disjunction() {
        let none = annotation_filter_sql(&AnnotationFilterOptions::default());
        assert_eq!(none, None);

        let all = annotation_filter_sql(&AnnotationFilterOptions {
            usual: true,
            ground_truth: true,
            skipped: true,
        })
        .unwrap();
        assert_eq!(
            all,
            "((NOT a.was_cancelled AND NOT a.ground_truth) OR a.ground_truth OR a.was_cancelled)"
        );

        let skipped_only = annotation_filter_sql(&AnnotationFilterOptions {
            skipped: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(skipped_only, "(a.was_cancelled)");
    }

    #[test]
    fn filter_modes_deserialize_from_api_payloads() {
        let options: TaskFilterOptions =
            serde_json::from_value(json!({"skipped": "exclude", "finished": "include"})).unwrap();
        assert_eq!(options.skipped, Some(FilterMode::Exclude));
        assert_eq!(options.finished, Some(FilterMode::Include));
        assert_eq!(options.annotated, None);
    }

    #[test]
    fn min_records_spread_task_data() {
        let tasks = vec![json!({
            "id": 42,
            "data": {"text": "hello", "id": "shadowed"},
            "annotations": [
                {
                    "id": 7,
                    "completed_by": {"id": "u-1", "username": "alice"},
                    "result": [{"value": "pos"}],
                    "lead_time": 3.5,
                    "created_at": "2025-03-01T10:00:00+00:00",
                    "updated_at": "2025-03-01T10:05:00+00:00"
                },
                {
                    "id": 8,
                    "completed_by": null,
                    "result": [],
                    "created_at": "2025-03-01T11:00:00+00:00",
                    "updated_at": "2025-03-01T11:00:00+00:00"
                }
            ],
            "predictions": []
        })];

        let records = json_min_records(&tasks);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["text"], "hello");
        assert_eq!(records[0]["id"], 42);
        assert_eq!(records[0]["annotation_id"], 7);
        assert_eq!(records[0]["annotator"], "alice");
        assert_eq!(records[1]["annotator"], Value::Null);
    }

    #[test]
    fn tasks_without_annotations_drop_out_of_min_records() {
        let tasks = vec![json!({"id": 1, "data": {"text": "x"}, "annotations": [], "predictions": []})];
        assert!(json_min_records(&tasks).is_empty());
    }
}
