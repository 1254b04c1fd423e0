pub mod csv;
pub mod snapshot;

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::warn;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::web::models::ProjectRow;

/// Formats the service can generate natively.
pub const EXPORT_FORMATS: [ExportFormat; 4] = [
    ExportFormat::Json,
    ExportFormat::JsonMin,
    ExportFormat::Csv,
    ExportFormat::Tsv,
];

/// Prefix of task data values that point at uploaded media.
const MEDIA_URI_PREFIX: &str = "/data/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    JsonMin,
    Csv,
    Tsv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::JsonMin => "JSON_MIN",
            ExportFormat::Csv => "CSV",
            ExportFormat::Tsv => "TSV",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json | ExportFormat::JsonMin => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json | ExportFormat::JsonMin => "application/json",
            ExportFormat::Csv => "text/csv",
            ExportFormat::Tsv => "text/tab-separated-values",
        }
    }

    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "JSON" => Some(ExportFormat::Json),
            "JSON_MIN" | "JSON-MIN" => Some(ExportFormat::JsonMin),
            "CSV" => Some(ExportFormat::Csv),
            "TSV" => Some(ExportFormat::Tsv),
            _ => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::JsonMin => "JSON-MIN",
            ExportFormat::Csv => "CSV",
            ExportFormat::Tsv => "TSV",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExportFormat::Json => "List of items in raw JSON format stored in one JSON file",
            ExportFormat::JsonMin => {
                "List of items where only completed annotations are stored, one record per annotation"
            }
            ExportFormat::Csv => "Results are stored as comma-separated values with column headers",
            ExportFormat::Tsv => "Results are stored in tab-separated tabular file with column headers",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FormatDescriptor {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

/// Descriptors for the format listing endpoint, in the order clients show
/// them.
pub fn format_descriptors() -> Vec<FormatDescriptor> {
    EXPORT_FORMATS
        .iter()
        .map(|format| FormatDescriptor {
            name: format.as_str(),
            title: format.title(),
            description: format.description(),
        })
        .collect()
}

/// Renders serialized tasks into the requested format.
pub fn render_tasks(format: ExportFormat, tasks: &[Value]) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            serde_json::to_vec(tasks).context("failed to encode task snapshot")
        }
        ExportFormat::JsonMin => serde_json::to_vec(&snapshot::json_min_records(tasks))
            .context("failed to encode flattened snapshot"),
        ExportFormat::Csv => csv::write_table(&snapshot::json_min_records(tasks), csv::CSV_DELIMITER),
        ExportFormat::Tsv => csv::write_table(&snapshot::json_min_records(tasks), csv::TSV_DELIMITER),
    }
}

pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn short_checksum(bytes: &[u8]) -> String {
    let mut digest = checksum_hex(bytes);
    digest.truncate(8);
    digest
}

pub fn timestamp_slug(moment: &DateTime<Utc>) -> String {
    moment.format("%Y-%m-%d-%H-%M").to_string()
}

/// Artifact basename for on-demand and background snapshots, without
/// extension.
pub fn export_basename(project_id: i64, moment: &DateTime<Utc>, digest: &str) -> String {
    format!("project-{project_id}-at-{}-{digest}", timestamp_slug(moment))
}

/// Basename of the flat files that the legacy listing endpoint picks up. The
/// listing keys on the numeric project prefix, so the name must start with
/// the bare project id.
pub fn legacy_basename(project_id: i64, moment: &DateTime<Utc>, digest: &str) -> String {
    format!("{project_id}-{}-{digest}", timestamp_slug(moment))
}

pub fn project_id_prefix(name: &str) -> Option<i64> {
    name.split('-').next()?.parse().ok()
}

fn is_legacy_snapshot(name: &str, project_id: i64) -> bool {
    name.ends_with(".json")
        && !name.ends_with("-info.json")
        && project_id_prefix(name) == Some(project_id)
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct LegacyExportFile {
    pub name: String,
    pub url: String,
}

/// Lists flat snapshot files of one project, newest first.
pub async fn legacy_export_entries(
    export_dir: &Path,
    project_id: i64,
    url_root: &str,
) -> Result<Vec<LegacyExportFile>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(export_dir)
        .await
        .with_context(|| format!("failed to read export directory {}", export_dir.display()))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .context("failed to iterate export directory")?
    {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if is_legacy_snapshot(name, project_id) {
            names.push(name.to_string());
        }
    }

    names.sort();
    names.reverse();

    Ok(names
        .into_iter()
        .map(|name| {
            let stem = name.strip_suffix(".json").unwrap_or(&name).to_string();
            let url = format!("{url_root}{name}");
            LegacyExportFile { name: stem, url }
        })
        .collect())
}

pub struct GeneratedExport {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
}

/// Builds the downloadable artifact for an on-demand export. Also drops the
/// flat JSON snapshot plus its `-info.json` companion into the export
/// directory so the legacy listing sees the run; failure to save those is
/// logged but does not fail the download.
pub fn generate_export_file(
    project: &ProjectRow,
    tasks: &[Value],
    format: ExportFormat,
    bundle_resources: bool,
    media_root: &Path,
    export_dir: &Path,
) -> Result<GeneratedExport> {
    let snapshot_json = render_tasks(ExportFormat::Json, tasks)?;
    let digest = short_checksum(&snapshot_json);
    let now = Utc::now();

    if let Err(err) = save_legacy_copies(export_dir, project, &snapshot_json, format, &now, &digest)
    {
        warn!(?err, project_id = project.id, "failed to save flat export copy");
    }

    let data = if format == ExportFormat::Json {
        snapshot_json
    } else {
        render_tasks(format, tasks)?
    };

    let basename = export_basename(project.id, &now, &digest);
    let resources = if bundle_resources {
        collect_resources(tasks, media_root)
    } else {
        Vec::new()
    };

    if resources.is_empty() {
        return Ok(GeneratedExport {
            filename: format!("{basename}.{}", format.extension()),
            content_type: format.content_type(),
            bytes: data,
        });
    }

    let mut entries = vec![(format!("{basename}.{}", format.extension()), data)];
    for resource in resources {
        match fs::read(&resource.path) {
            Ok(bytes) => entries.push((resource.archive_name, bytes)),
            Err(err) => {
                warn!(?err, file = %resource.path.display(), "failed to read referenced media, skipping");
            }
        }
    }

    Ok(GeneratedExport {
        filename: format!("{basename}.zip"),
        content_type: "application/zip",
        bytes: build_zip(entries)?,
    })
}

fn save_legacy_copies(
    export_dir: &Path,
    project: &ProjectRow,
    snapshot_json: &[u8],
    format: ExportFormat,
    now: &DateTime<Utc>,
    digest: &str,
) -> Result<()> {
    let basename = legacy_basename(project.id, now, digest);
    let data_path = export_dir.join(format!("{basename}.json"));
    let info_path = export_dir.join(format!("{basename}-info.json"));

    let info = json!({
        "project": {
            "id": project.id,
            "title": project.title,
            "created_at": project.created_at.to_rfc3339(),
        },
        "platform": {
            "version": env!("CARGO_PKG_VERSION"),
        },
        "download": {
            "format": format.as_str(),
            "created_at": now.to_rfc3339(),
        },
    });

    fs::write(&data_path, snapshot_json)
        .with_context(|| format!("failed to write {}", data_path.display()))?;
    fs::write(&info_path, serde_json::to_vec(&info)?)
        .with_context(|| format!("failed to write {}", info_path.display()))?;
    Ok(())
}

struct ResourceRef {
    archive_name: String,
    path: PathBuf,
}

/// Finds media files referenced from task data. References are strings
/// anywhere in the data tree that start with `/data/` and resolve to a file
/// under the media root. Missing files are skipped with a warning.
fn collect_resources(tasks: &[Value], media_root: &Path) -> Vec<ResourceRef> {
    let mut uris = BTreeSet::new();
    for task in tasks {
        if let Some(data) = task.get("data") {
            collect_media_uris(data, &mut uris);
        }
    }

    let mut resources = Vec::new();
    for uri in uris {
        let relative = &uri[MEDIA_URI_PREFIX.len()..];
        if relative.starts_with('/')
            || Path::new(relative)
                .components()
                .any(|part| matches!(part, Component::ParentDir))
        {
            warn!(%uri, "refusing media reference outside the media root");
            continue;
        }

        let path = media_root.join(relative);
        if path.is_file() {
            resources.push(ResourceRef {
                archive_name: relative.to_string(),
                path,
            });
        } else {
            warn!(%uri, "referenced media file missing, skipping");
        }
    }

    resources
}

fn collect_media_uris(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            if text.starts_with(MEDIA_URI_PREFIX) {
                out.insert(text.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_media_uris(item, out);
            }
        }
        Value::Object(fields) => {
            for item in fields.values() {
                collect_media_uris(item, out);
            }
        }
        _ => {}
    }
}

fn build_zip(entries: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, bytes) in entries {
        writer
            .start_file(name, options)
            .context("failed to start bundle entry")?;
        writer
            .write_all(&bytes)
            .context("failed to write bundle entry")?;
    }

    let cursor = writer.finish().context("failed to finish bundle")?;
    Ok(cursor.into_inner())
}

/// On-disk location of a snapshot rendered into `format`. The stored JSON
/// snapshot serves itself; other formats cache as siblings. JSON_MIN gets a
/// distinct `.min.json` suffix, since its plain extension would name the
/// snapshot itself.
pub fn converted_path(snapshot_path: &Path, format: ExportFormat) -> PathBuf {
    match format {
        ExportFormat::Json => snapshot_path.to_path_buf(),
        ExportFormat::JsonMin => snapshot_path.with_extension("min.json"),
        ExportFormat::Csv | ExportFormat::Tsv => snapshot_path.with_extension(format.extension()),
    }
}

/// Converts a stored JSON snapshot into another format, caching the result
/// next to the snapshot. Returns the path and filename to serve.
pub fn convert_snapshot(snapshot_path: &Path, format: ExportFormat) -> Result<(PathBuf, String)> {
    let target = converted_path(snapshot_path, format);

    let filename = target
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("snapshot path has no usable filename"))?;

    if format == ExportFormat::Json || target.exists() {
        return Ok((target, filename));
    }

    let raw = fs::read(snapshot_path)
        .with_context(|| format!("failed to read snapshot {}", snapshot_path.display()))?;
    let tasks: Vec<Value> =
        serde_json::from_slice(&raw).context("stored snapshot is not a JSON task list")?;
    let rendered = render_tasks(format, &tasks)?;
    fs::write(&target, rendered)
        .with_context(|| format!("failed to write converted file {}", target.display()))?;

    Ok((target, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::io::Read;

    fn sample_moment() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap()
    }

    #[test]
    fn format_parsing_is_case_insensitive() {
        assert_eq!(ExportFormat::from_param("csv"), Some(ExportFormat::Csv));
        assert_eq!(
            ExportFormat::from_param(" JSON_MIN "),
            Some(ExportFormat::JsonMin)
        );
        assert_eq!(ExportFormat::from_param("YOLO"), None);
    }

    #[test]
    fn basenames_follow_naming_scheme() {
        let moment = sample_moment();
        assert_eq!(
            export_basename(12, &moment, "abcd1234"),
            "project-12-at-2025-03-01-10-30-abcd1234"
        );
        assert_eq!(
            legacy_basename(12, &moment, "abcd1234"),
            "12-2025-03-01-10-30-abcd1234"
        );
    }

    #[test]
    fn legacy_snapshot_detection() {
        assert!(is_legacy_snapshot("5-2025-03-01-10-30-abcd1234.json", 5));
        assert!(!is_legacy_snapshot("5-2025-03-01-10-30-abcd1234-info.json", 5));
        assert!(!is_legacy_snapshot("6-2025-03-01-10-30-abcd1234.json", 5));
        assert!(!is_legacy_snapshot("project-5-at-2025-03-01-10-30-abcd1234.json", 5));
        assert!(!is_legacy_snapshot("5-2025-03-01.csv", 5));
    }

    #[test]
    fn short_checksum_is_eight_hex_chars() {
        let digest = short_checksum(b"[]");
        assert_eq!(digest.len(), 8);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn legacy_entries_are_filtered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "5-2025-03-01-10-30-aaaa1111.json",
            "5-2025-03-02-09-00-bbbb2222.json",
            "5-2025-03-01-10-30-aaaa1111-info.json",
            "6-2025-03-01-10-30-cccc3333.json",
            "project-5-at-2025-03-01-10-30-dddd4444.json",
        ] {
            std::fs::write(dir.path().join(name), b"[]").unwrap();
        }

        let entries = legacy_export_entries(dir.path(), 5, "/export/")
            .await
            .unwrap();
        assert_eq!(
            entries,
            vec![
                LegacyExportFile {
                    name: "5-2025-03-02-09-00-bbbb2222".to_string(),
                    url: "/export/5-2025-03-02-09-00-bbbb2222.json".to_string(),
                },
                LegacyExportFile {
                    name: "5-2025-03-01-10-30-aaaa1111".to_string(),
                    url: "/export/5-2025-03-01-10-30-aaaa1111.json".to_string(),
                },
            ]
        );
    }

    #[test]
    fn resources_are_unique_and_confined_to_media_root() {
        let media = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(media.path().join("upload")).unwrap();
        std::fs::write(media.path().join("upload/a.png"), b"png").unwrap();

        let tasks = vec![json!({
            "id": 1,
            "data": {
                "image": "/data/upload/a.png",
                "repeat": "/data/upload/a.png",
                "missing": "/data/upload/gone.png",
                "hostile": "/data/../secret.txt",
                "nested": {"deep": ["/data/upload/a.png"]}
            }
        })];

        let resources = collect_resources(&tasks, media.path());
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].archive_name, "upload/a.png");
    }

    #[test]
    fn bundle_contains_all_entries() {
        let bytes = build_zip(vec![
            ("export.json".to_string(), b"[]".to_vec()),
            ("upload/a.png".to_string(), b"png".to_vec()),
        ])
        .unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["export.json", "upload/a.png"]);

        let mut content = String::new();
        archive
            .by_name("export.json")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "[]");
    }

    #[test]
    fn conversion_caches_next_to_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("project-5-at-2025-03-01-10-30-abcd1234.json");
        let tasks = json!([{
            "id": 1,
            "data": {"text": "hello"},
            "annotations": [{
                "id": 2,
                "completed_by": {"id": "u-1", "username": "alice"},
                "result": [],
                "created_at": "2025-03-01T10:00:00+00:00",
                "updated_at": "2025-03-01T10:00:00+00:00"
            }],
            "predictions": []
        }]);
        std::fs::write(&snapshot, serde_json::to_vec(&tasks).unwrap()).unwrap();

        let (path, filename) = convert_snapshot(&snapshot, ExportFormat::Csv).unwrap();
        assert_eq!(filename, "project-5-at-2025-03-01-10-30-abcd1234.csv");
        assert!(path.exists());

        let table = std::fs::read_to_string(&path).unwrap();
        let header = table.lines().next().unwrap();
        assert!(header.contains("annotation_id"));
        assert!(header.contains("text"));

        let (json_path, _) = convert_snapshot(&snapshot, ExportFormat::Json).unwrap();
        assert_eq!(json_path, snapshot);
    }

    #[test]
    fn json_min_conversion_flattens_into_a_distinct_file() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("project-7-at-2025-03-01-10-30-abcd1234.json");
        let tasks = json!([{
            "id": 3,
            "data": {"text": "hello"},
            "annotations": [{
                "id": 14,
                "completed_by": {"id": "u-1", "username": "alice"},
                "result": [{"value": {"choices": ["pos"]}}],
                "created_at": "2025-03-01T10:00:00+00:00",
                "updated_at": "2025-03-01T10:00:00+00:00"
            }],
            "predictions": []
        }]);
        std::fs::write(&snapshot, serde_json::to_vec(&tasks).unwrap()).unwrap();

        let (path, filename) = convert_snapshot(&snapshot, ExportFormat::JsonMin).unwrap();
        assert_ne!(path, snapshot);
        assert_eq!(filename, "project-7-at-2025-03-01-10-30-abcd1234.min.json");

        let records: Vec<Value> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["annotation_id"], 14);
        assert_eq!(records[0]["text"], "hello");
        assert!(records[0].get("annotations").is_none());

        // the stored snapshot keeps its raw task objects
        let raw: Vec<Value> =
            serde_json::from_slice(&std::fs::read(&snapshot).unwrap()).unwrap();
        assert!(raw[0].get("annotations").is_some());
    }

    #[test]
    fn generated_export_bundles_resources_into_zip() {
        let media = tempfile::tempdir().unwrap();
        std::fs::write(media.path().join("a.png"), b"png").unwrap();
        let export_dir = tempfile::tempdir().unwrap();

        let project = ProjectRow {
            id: 9,
            title: "Demo".to_string(),
            created_at: sample_moment(),
        };
        let tasks = vec![json!({"id": 1, "data": {"image": "/data/a.png"}, "annotations": [], "predictions": []})];

        let generated = generate_export_file(
            &project,
            &tasks,
            ExportFormat::Json,
            true,
            media.path(),
            export_dir.path(),
        )
        .unwrap();

        assert!(generated.filename.starts_with("project-9-at-"));
        assert!(generated.filename.ends_with(".zip"));
        assert_eq!(generated.content_type, "application/zip");

        let flat_files: Vec<String> = std::fs::read_dir(export_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(flat_files.iter().any(|name| name.starts_with("9-") && name.ends_with("-info.json")));
        assert!(
            flat_files
                .iter()
                .any(|name| name.starts_with("9-") && name.ends_with(".json") && !name.ends_with("-info.json"))
        );
    }
}
