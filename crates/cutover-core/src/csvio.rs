//! CSV ingestion and template generation for manual batches
//!
//! Parsing is RFC 4180-style: double-quote quoting with `""` escapes, `\r\n`
//! or `\n` record separators, a tolerated UTF-8 BOM. Header matching is
//! case-insensitive and all values are trimmed.

use std::collections::BTreeSet;
use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::runbook::RunbookSpec;

/// A parsed CSV document: header row plus data rows
#[derive(Debug, Clone, PartialEq)]
pub struct CsvDocument {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Parse a CSV document. The first record is the header row.
pub fn parse(text: &str) -> Result<CsvDocument> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.trim().is_empty() => {
                in_quotes = true;
                field_started = true;
                field.clear();
            }
            ',' => {
                record.push(field.trim().to_string());
                field.clear();
                field_started = true;
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_record(&mut records, &mut record, &mut field, &mut field_started);
            }
            '\n' => {
                end_record(&mut records, &mut record, &mut field, &mut field_started);
            }
            _ => {
                field.push(c);
                field_started = true;
            }
        }
    }
    if in_quotes {
        return Err(CoreError::csv("unterminated quoted field"));
    }
    end_record(&mut records, &mut record, &mut field, &mut field_started);

    let mut records = records.into_iter();
    let headers = records
        .next()
        .ok_or_else(|| CoreError::csv("document has no header row"))?;
    Ok(CsvDocument {
        headers,
        rows: records.collect(),
    })
}

fn end_record(
    records: &mut Vec<Vec<String>>,
    record: &mut Vec<String>,
    field: &mut String,
    field_started: &mut bool,
) {
    // A bare newline between records is not an empty record
    if record.is_empty() && field.trim().is_empty() && !*field_started {
        field.clear();
        return;
    }
    record.push(field.trim().to_string());
    field.clear();
    records.push(std::mem::take(record));
    *field_started = false;
}

/// Validated member rows from a CSV upload
#[derive(Debug, Clone)]
pub struct CsvIngest {
    /// One map per data row; required columns use their canonical spelling
    pub rows: Vec<BTreeMap<String, String>>,
    /// Non-fatal findings (unexpected columns)
    pub warnings: Vec<String>,
}

/// The columns a member CSV must provide for `spec`: the primary key plus
/// every member column referenced by phase steps.
pub fn required_columns(spec: &RunbookSpec) -> BTreeSet<String> {
    let mut required = spec.referenced_member_columns();
    required.insert(spec.data_source.primary_key.clone());
    required
}

/// Validate a parsed document against the runbook's required columns.
///
/// Header matching is case-insensitive; missing required columns, duplicate
/// primary keys, and empty primary keys are errors; unexpected columns are
/// warnings. Extra columns are carried through into the row maps so they end
/// up in the member snapshot.
pub fn validate_members(
    doc: &CsvDocument,
    primary_key: &str,
    required: &BTreeSet<String>,
) -> Result<CsvIngest> {
    let mut column_names: Vec<String> = Vec::with_capacity(doc.headers.len());
    let mut matched: BTreeSet<&str> = BTreeSet::new();
    for header in &doc.headers {
        match required
            .iter()
            .find(|r| r.eq_ignore_ascii_case(header))
        {
            Some(canonical) => {
                column_names.push(canonical.clone());
                matched.insert(canonical);
            }
            None => column_names.push(header.clone()),
        }
    }

    let missing: Vec<&String> = required
        .iter()
        .filter(|r| !matched.contains(r.as_str()))
        .collect();
    if !missing.is_empty() {
        return Err(CoreError::csv(format!(
            "missing required columns: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let warnings: Vec<String> = doc
        .headers
        .iter()
        .filter(|h| !required.iter().any(|r| r.eq_ignore_ascii_case(h)))
        .map(|h| format!("unexpected column {h:?}"))
        .collect();

    let mut rows = Vec::with_capacity(doc.rows.len());
    let mut seen_keys: BTreeSet<String> = BTreeSet::new();
    for (line, raw) in doc.rows.iter().enumerate() {
        if raw.len() > column_names.len() {
            return Err(CoreError::csv(format!(
                "row {} has {} fields, expected {}",
                line + 2,
                raw.len(),
                column_names.len()
            )));
        }
        let mut row = BTreeMap::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = raw.get(i).cloned().unwrap_or_default();
            row.insert(name.clone(), value);
        }

        let key = row.get(primary_key).cloned().unwrap_or_default();
        if key.is_empty() {
            return Err(CoreError::csv(format!(
                "row {} has an empty primary key",
                line + 2
            )));
        }
        if !seen_keys.insert(key.clone()) {
            return Err(CoreError::csv(format!(
                "duplicate primary key {key:?} at row {}",
                line + 2
            )));
        }
        rows.push(row);
    }

    Ok(CsvIngest { rows, warnings })
}

/// Generate a CSV upload template for a runbook: header row plus one sample
/// row with values guessed from the column names.
pub fn template(spec: &RunbookSpec) -> Result<String> {
    let mut columns: Vec<String> = vec![spec.data_source.primary_key.clone()];
    for column in spec.data_source.projection()? {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    for column in spec.referenced_member_columns() {
        if !column.starts_with('_') && !columns.contains(&column) {
            columns.push(column);
        }
    }

    let header: Vec<String> = columns.iter().map(|c| escape_field(c)).collect();
    let sample: Vec<String> = columns
        .iter()
        .map(|c| escape_field(&sample_value(c, spec)))
        .collect();

    Ok(format!("{}\n{}\n", header.join(","), sample.join(",")))
}

fn sample_value(column: &str, spec: &RunbookSpec) -> String {
    if let Some(format) = spec.data_source.multi_valued_format(column) {
        return format.example();
    }
    let lower = column.to_ascii_lowercase();
    if lower.contains("email") || lower.contains("mail") {
        "user@example.com".to_string()
    } else if lower == "id" || lower.ends_with("_id") || lower.ends_with("id") {
        "sample_id_001".to_string()
    } else if lower.contains("date") || lower.contains("time") || lower.ends_with("_at") {
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        "sample_value".to_string()
    }
}

/// Quote a field when it contains a comma, quote, or newline.
pub fn escape_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> RunbookSpec {
        let doc = json!({
            "name": "rb",
            "data_source": {
                "type": "sql_warehouse",
                "connection": "wh",
                "query": "SELECT user_id, email, licenses FROM cohort",
                "primary_key": "user_id",
                "batch_time": "immediate",
                "multi_valued_columns": [
                    {"name": "licenses", "format": "semicolon_delimited"}
                ]
            },
            "phases": [{
                "name": "move",
                "offset": "T-0",
                "steps": [{
                    "name": "migrate",
                    "worker_id": "mover",
                    "function": "Migrate",
                    "params": {"user": "{{user_id}}", "region": "{{region}}"}
                }]
            }]
        });
        RunbookSpec::parse(&doc.to_string()).unwrap()
    }

    #[test]
    fn test_parse_quoting_and_crlf() {
        let doc = parse("a,b,c\r\n1,\"x, y\",\"say \"\"hi\"\"\"\r\n").unwrap();
        assert_eq!(doc.headers, vec!["a", "b", "c"]);
        assert_eq!(doc.rows, vec![vec!["1", "x, y", "say \"hi\""]]);
    }

    #[test]
    fn test_parse_bom_and_plain_newlines() {
        let with_bom = parse("\u{feff}a,b\n1,2\n").unwrap();
        let without = parse("a,b\n1,2\n").unwrap();
        assert_eq!(with_bom, without);
    }

    #[test]
    fn test_parse_trims_values() {
        let doc = parse("a , b\n 1 ,  2 \n").unwrap();
        assert_eq!(doc.headers, vec!["a", "b"]);
        assert_eq!(doc.rows, vec![vec!["1", "2"]]);
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        let doc = parse("a,b\n\n1,2\n\n").unwrap();
        assert_eq!(doc.rows.len(), 1);
    }

    #[test]
    fn test_parse_multiline_quoted_field() {
        let doc = parse("a,b\n1,\"two\nlines\"\n").unwrap();
        assert_eq!(doc.rows, vec![vec!["1", "two\nlines"]]);
    }

    #[test]
    fn test_parse_unterminated_quote() {
        assert!(parse("a,b\n1,\"oops\n").is_err());
    }

    #[test]
    fn test_required_columns() {
        let required = required_columns(&spec());
        assert!(required.contains("user_id"));
        assert!(required.contains("region"));
        assert!(!required.iter().any(|c| c.starts_with('_')));
    }

    #[test]
    fn test_validate_case_insensitive_headers() {
        let doc = parse("USER_ID,Region\nu1,west\n").unwrap();
        let ingest = validate_members(&doc, "user_id", &required_columns(&spec())).unwrap();
        assert_eq!(ingest.rows[0]["user_id"], "u1");
        assert_eq!(ingest.rows[0]["region"], "west");
        assert!(ingest.warnings.is_empty());
    }

    #[test]
    fn test_validate_missing_required() {
        let doc = parse("user_id\nu1\n").unwrap();
        let err = validate_members(&doc, "user_id", &required_columns(&spec())).unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_validate_unexpected_warns_and_carries_value() {
        let doc = parse("user_id,region,notes\nu1,west,hello\n").unwrap();
        let ingest = validate_members(&doc, "user_id", &required_columns(&spec())).unwrap();
        assert_eq!(ingest.warnings.len(), 1);
        assert!(ingest.warnings[0].contains("notes"));
        assert_eq!(ingest.rows[0]["notes"], "hello");
    }

    #[test]
    fn test_validate_duplicate_key() {
        let doc = parse("user_id,region\nu1,west\nu1,east\n").unwrap();
        assert!(validate_members(&doc, "user_id", &required_columns(&spec())).is_err());
    }

    #[test]
    fn test_validate_empty_key() {
        let doc = parse("user_id,region\n,west\n").unwrap();
        assert!(validate_members(&doc, "user_id", &required_columns(&spec())).is_err());
    }

    #[test]
    fn test_template_columns_and_samples() {
        let csv = template(&spec()).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        let sample = lines.next().unwrap();

        assert_eq!(header, "user_id,email,licenses,region");
        assert!(sample.starts_with("sample_id_001,user@example.com,value1;value2,"));
        assert!(sample.ends_with("sample_value"));
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
