use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

const DEFAULT_EXPORT_DIR: &str = "storage/export";
const DEFAULT_MEDIA_ROOT: &str = "storage/media";
const DEFAULT_EXPORT_URL_ROOT: &str = "/export/";

/// Runtime settings for snapshot storage, read once at startup.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Root directory for generated snapshot files. Per-project snapshots go
    /// into `<export_dir>/<project_id>/`, legacy flat files sit directly here.
    pub export_dir: PathBuf,
    /// Directory where uploaded task media lives, used when bundling
    /// resources referenced from task data.
    pub media_root: PathBuf,
    /// Public URL prefix under which the reverse proxy serves `export_dir`.
    pub export_url_root: String,
    /// Whether downloads bundle referenced media by default when the request
    /// does not say otherwise.
    pub download_resources: bool,
}

impl ExportConfig {
    pub fn from_env() -> Result<Self> {
        let export_dir = env::var("EXPORT_DIR").unwrap_or_else(|_| DEFAULT_EXPORT_DIR.to_string());
        let media_root = env::var("MEDIA_ROOT").unwrap_or_else(|_| DEFAULT_MEDIA_ROOT.to_string());
        let export_url_root =
            env::var("EXPORT_URL_ROOT").unwrap_or_else(|_| DEFAULT_EXPORT_URL_ROOT.to_string());

        let download_resources = match env::var("EXPORT_DOWNLOAD_RESOURCES") {
            Ok(raw) => parse_bool_env(&raw)
                .ok_or_else(|| anyhow!("invalid EXPORT_DOWNLOAD_RESOURCES value: {raw}"))?,
            Err(_) => true,
        };

        Ok(Self {
            export_dir: PathBuf::from(export_dir),
            media_root: PathBuf::from(media_root),
            export_url_root: normalize_url_root(&export_url_root),
            download_resources,
        })
    }

    /// Creates the storage directories if they do not exist yet.
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.export_dir).with_context(|| {
            format!(
                "failed to create export directory {}",
                self.export_dir.display()
            )
        })?;
        fs::create_dir_all(&self.media_root).with_context(|| {
            format!(
                "failed to create media directory {}",
                self.media_root.display()
            )
        })?;
        Ok(())
    }

    pub fn project_export_dir(&self, project_id: i64) -> PathBuf {
        self.export_dir.join(project_id.to_string())
    }

    pub fn legacy_export_dir(&self) -> &Path {
        &self.export_dir
    }
}

fn normalize_url_root(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn parse_bool_env(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_root_gets_trailing_slash() {
        assert_eq!(normalize_url_root("/export"), "/export/");
        assert_eq!(normalize_url_root("/export/"), "/export/");
        assert_eq!(normalize_url_root("  /files "), "/files/");
    }

    #[test]
    fn bool_env_accepts_common_spellings() {
        assert_eq!(parse_bool_env("true"), Some(true));
        assert_eq!(parse_bool_env("ON"), Some(true));
        assert_eq!(parse_bool_env("0"), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }
}
