use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

pub const CSV_DELIMITER: u8 = b',';
pub const TSV_DELIMITER: u8 = b'\t';

/// Render flattened annotation records as a delimited table. Columns are the
/// sorted union of keys across all records; composite values are embedded as
/// compact JSON text.
pub fn write_table(records: &[Value], delimiter: u8) -> Result<Vec<u8>> {
    let columns = column_names(records);
    if columns.is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    writer
        .write_record(&columns)
        .context("failed to write table header")?;

    for record in records {
        let row: Vec<String> = columns
            .iter()
            .map(|column| cell_text(record.get(column.as_str())))
            .collect();
        writer
            .write_record(&row)
            .context("failed to write table row")?;
    }

    writer
        .into_inner()
        .map_err(|err| anyhow!("failed to finish table writer: {err}"))
}

fn column_names(records: &[Value]) -> Vec<String> {
    let mut columns = BTreeSet::new();
    for record in records {
        if let Some(object) = record.as_object() {
            for key in object.keys() {
                columns.insert(key.clone());
            }
        }
    }
    columns.into_iter().collect()
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn columns_are_sorted_union_of_keys() {
        let records = vec![
            json!({"text": "hello", "id": 1}),
            json!({"id": 2, "annotator": "alice"}),
        ];
        let table = write_table(&records, CSV_DELIMITER).unwrap();
        let text = String::from_utf8(table).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("annotator,id,text"));
        assert_eq!(lines.next(), Some(",1,hello"));
        assert_eq!(lines.next(), Some("alice,2,"));
    }

    #[test]
    fn composite_values_become_json_text() {
        let records = vec![json!({"id": 7, "result": [{"label": "cat"}]})];
        let table = write_table(&records, CSV_DELIMITER).unwrap();
        let text = String::from_utf8(table).unwrap();
        assert!(text.contains("\"[{\"\"label\"\":\"\"cat\"\"}]\""));
    }

    #[test]
    fn tab_delimiter_is_honored() {
        let records = vec![json!({"a": 1, "b": 2})];
        let table = write_table(&records, TSV_DELIMITER).unwrap();
        let text = String::from_utf8(table).unwrap();
        assert_eq!(text.lines().next(), Some("a\tb"));
    }

    #[test]
    fn no_records_produce_empty_output() {
        assert!(write_table(&[], CSV_DELIMITER).unwrap().is_empty());
    }
}
