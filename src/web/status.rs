use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;

/// Lifecycle of an export snapshot job as stored in `exports.status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    Other(Cow<'static, str>),
}

impl ExportStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ExportStatus::Created => "created",
            ExportStatus::InProgress => "in_progress",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
            ExportStatus::Other(value) => value.as_ref(),
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "created" => ExportStatus::Created,
            "in_progress" => ExportStatus::InProgress,
            "completed" => ExportStatus::Completed,
            "failed" => ExportStatus::Failed,
            other => ExportStatus::Other(Cow::Owned(other.to_string())),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExportStatus::Completed)
    }
}

impl Serialize for ExportStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExportStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(ExportStatus::from_str(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ExportStatus::Created,
            ExportStatus::InProgress,
            ExportStatus::Completed,
            ExportStatus::Failed,
        ] {
            assert_eq!(ExportStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_is_preserved() {
        let status = ExportStatus::from_str("archived");
        assert_eq!(status.as_str(), "archived");
        assert!(!status.is_completed());
    }
}
