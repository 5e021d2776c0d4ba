//! Runbook specification model
//!
//! A runbook is a JSON document describing a data source, optional init
//! steps, an ordered phase list, and failure handling. Documents are parsed
//! and validated once when a version is published and again when loaded from
//! the store; everything downstream (planner, scheduler, orchestrator) works
//! against the typed model.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ident;
use crate::offset;
use crate::projection;
use crate::template;

/// Parsed runbook specification document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunbookSpec {
    pub name: String,
    pub data_source: DataSourceSpec,
    #[serde(default)]
    pub init: Vec<StepSpec>,
    pub phases: Vec<PhaseSpec>,
    #[serde(default)]
    pub on_member_removed: Vec<StepSpec>,
    /// Named step lists referenced by `on_failure`
    #[serde(default)]
    pub rollbacks: BTreeMap<String, Vec<StepSpec>>,
    /// Default retry applied to steps that declare none
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

/// Data-source back-end selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    SqlWarehouse,
    BusinessDb,
}

/// Data-source descriptor of a runbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceSpec {
    #[serde(rename = "type")]
    pub source_type: DataSourceType,
    /// Connection label resolved against engine configuration
    pub connection: String,
    pub query: String,
    pub primary_key: String,
    /// `immediate`, `column`, or `column:<name>`
    pub batch_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_time_column: Option<String>,
    #[serde(default)]
    pub multi_valued_columns: Vec<MultiValuedColumn>,
}

/// How batch start times are derived from query rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchTimeMode {
    /// Rows observed now belong to a batch at "now" quantized to 5 minutes
    Immediate,
    /// Each row carries its own event time in the named column
    Column(String),
}

impl DataSourceSpec {
    /// Resolve the declared batch-time mode.
    pub fn batch_time_mode(&self) -> Result<BatchTimeMode> {
        match self.batch_time.as_str() {
            "immediate" => Ok(BatchTimeMode::Immediate),
            "column" => self
                .batch_time_column
                .clone()
                .map(BatchTimeMode::Column)
                .ok_or_else(|| {
                    CoreError::spec("batch_time \"column\" requires batch_time_column")
                }),
            other => match other.strip_prefix("column:") {
                Some(col) if !col.is_empty() => Ok(BatchTimeMode::Column(col.to_string())),
                _ => Err(CoreError::spec(format!(
                    "unknown batch_time mode {other:?}"
                ))),
            },
        }
    }

    /// Output columns of the declared query.
    pub fn projection(&self) -> Result<Vec<String>> {
        projection::select_columns(&self.query)
    }

    /// The declared format of a multi-valued column, if any.
    pub fn multi_valued_format(&self, column: &str) -> Option<MultiValuedFormat> {
        self.multi_valued_columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.format)
    }
}

/// A query column holding several values in one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiValuedColumn {
    pub name: String,
    pub format: MultiValuedFormat,
}

/// Source encoding of a multi-valued cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiValuedFormat {
    SemicolonDelimited,
    CommaDelimited,
    JsonArray,
}

impl MultiValuedFormat {
    /// Split a raw cell into its values. Delimited formats trim items and
    /// drop empties; a malformed JSON array yields the raw cell as a single
    /// value rather than losing data.
    pub fn parse_values(&self, raw: &str) -> Vec<String> {
        let split = |sep: char| {
            raw.split(sep)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        match self {
            MultiValuedFormat::SemicolonDelimited => split(';'),
            MultiValuedFormat::CommaDelimited => split(','),
            MultiValuedFormat::JsonArray => {
                match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
                    Ok(values) => values
                        .into_iter()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect(),
                    Err(_) => vec![raw.to_string()],
                }
            }
        }
    }

    /// Example cell content in this format, for CSV templates.
    pub fn example(&self) -> String {
        match self {
            MultiValuedFormat::SemicolonDelimited => "value1;value2".to_string(),
            MultiValuedFormat::CommaDelimited => "value1,value2".to_string(),
            MultiValuedFormat::JsonArray => "[\"value1\",\"value2\"]".to_string(),
        }
    }
}

/// A phase: ordered steps sharing one T-relative offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub offset: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl PhaseSpec {
    pub fn offset_minutes(&self) -> Result<i64> {
        offset::parse_offset(&self.offset)
    }
}

/// One unit of work executed by a designated worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub worker_id: String,
    pub function: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// result-field → member data key to merge on success
    #[serde(default)]
    pub output_params: BTreeMap<String, String>,
}

/// Poll cadence for long-running worker operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSpec {
    pub interval: String,
    pub timeout: String,
}

impl PollSpec {
    pub fn interval_secs(&self) -> Result<i64> {
        offset::parse_duration(&self.interval)
    }

    pub fn timeout_secs(&self) -> Result<i64> {
        offset::parse_duration(&self.timeout)
    }
}

/// Retry budget for worker-reported failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_retries: i32,
    pub interval: String,
}

impl RetrySpec {
    pub fn interval_secs(&self) -> Result<i64> {
        offset::parse_duration(&self.interval)
    }
}

impl RunbookSpec {
    /// Parse and validate a specification document.
    pub fn parse(document: &str) -> Result<Self> {
        let spec: RunbookSpec = serde_json::from_str(document)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Publish-time validation: grammar, identifier safety, reference
    /// integrity, and projection coverage of the primary key.
    pub fn validate(&self) -> Result<()> {
        ident::ensure_safe_identifier(&self.name)?;
        ident::ensure_safe_identifier(&self.data_source.primary_key)?;

        let mode = self.data_source.batch_time_mode()?;
        if let BatchTimeMode::Column(col) = &mode {
            ident::ensure_safe_identifier(col)?;
        }

        let columns = self.data_source.projection()?;
        for column in &columns {
            ident::ensure_safe_identifier(column)?;
        }
        if !columns.contains(&self.data_source.primary_key) {
            return Err(CoreError::spec(format!(
                "query projection does not include primary key {:?}",
                self.data_source.primary_key
            )));
        }
        if let BatchTimeMode::Column(col) = &mode {
            if !columns.contains(col) {
                return Err(CoreError::spec(format!(
                    "query projection does not include batch time column {col:?}"
                )));
            }
        }
        for mv in &self.data_source.multi_valued_columns {
            ident::ensure_safe_identifier(&mv.name)?;
            if !columns.contains(&mv.name) {
                return Err(CoreError::spec(format!(
                    "multi-valued column {:?} is not in the query projection",
                    mv.name
                )));
            }
        }

        if self.phases.is_empty() {
            return Err(CoreError::spec("runbook declares no phases"));
        }
        let mut phase_names = BTreeSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(CoreError::spec("phase with empty name"));
            }
            if !phase_names.insert(phase.name.as_str()) {
                return Err(CoreError::spec(format!(
                    "duplicate phase name {:?}",
                    phase.name
                )));
            }
            phase.offset_minutes()?;
            for step in &phase.steps {
                self.validate_step(step, &phase.name)?;
            }
        }

        for step in &self.init {
            self.validate_step(step, "init")?;
            // Init runs before any member exists, so only reserved names
            // can resolve.
            for name in step_placeholders(step) {
                if !name.starts_with('_') {
                    return Err(CoreError::spec(format!(
                        "init step {:?} references member column {name:?}",
                        step.name
                    )));
                }
            }
        }
        for step in &self.on_member_removed {
            self.validate_step(step, "on_member_removed")?;
        }
        for (list_name, steps) in &self.rollbacks {
            for step in steps {
                self.validate_step(step, list_name)?;
            }
        }

        Ok(())
    }

    fn validate_step(&self, step: &StepSpec, scope: &str) -> Result<()> {
        if step.name.trim().is_empty()
            || step.worker_id.trim().is_empty()
            || step.function.trim().is_empty()
        {
            return Err(CoreError::spec(format!(
                "step in {scope:?} is missing name, worker_id, or function"
            )));
        }
        if let Some(poll) = &step.poll {
            poll.interval_secs()?;
            poll.timeout_secs()?;
        }
        if let Some(retry) = &step.retry {
            retry.interval_secs()?;
            if retry.max_retries < 0 {
                return Err(CoreError::spec(format!(
                    "step {:?} declares a negative retry budget",
                    step.name
                )));
            }
        }
        if let Some(reference) = &step.on_failure {
            if !self.rollbacks.contains_key(reference) {
                return Err(CoreError::spec(format!(
                    "step {:?} references unknown rollback {reference:?}",
                    step.name
                )));
            }
        }
        Ok(())
    }

    /// Find a phase by name.
    pub fn phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Resolve an `on_failure` reference to its step list.
    pub fn rollback_steps(&self, reference: &str) -> Option<&[StepSpec]> {
        self.rollbacks.get(reference).map(Vec::as_slice)
    }

    /// A step's retry spec, falling back to the runbook default.
    pub fn effective_retry<'a>(&'a self, step: &'a StepSpec) -> Option<&'a RetrySpec> {
        step.retry.as_ref().or(self.retry.as_ref())
    }

    /// Every placeholder referenced by phase steps (params and function),
    /// reserved names excluded. These are the member columns a data source
    /// or CSV must provide.
    pub fn referenced_member_columns(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for phase in &self.phases {
            for step in &phase.steps {
                for name in step_placeholders(step) {
                    if !name.starts_with('_') {
                        names.insert(name);
                    }
                }
            }
        }
        names
    }
}

fn step_placeholders(step: &StepSpec) -> Vec<String> {
    let mut names = template::placeholder_names(&step.function);
    for value in step.params.values() {
        for name in template::placeholder_names(value) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Name of the per-runbook dynamic data table for (name, version).
pub fn dynamic_table_name(runbook_name: &str, version: i32) -> String {
    format!("rbdata_{}_v{}", runbook_name.to_ascii_lowercase(), version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_doc() -> serde_json::Value {
        json!({
            "name": "mailbox_cutover",
            "data_source": {
                "type": "sql_warehouse",
                "connection": "warehouse_prod",
                "query": "SELECT user_id, email, cutover_at FROM cohort",
                "primary_key": "user_id",
                "batch_time": "column",
                "batch_time_column": "cutover_at"
            },
            "phases": [
                {
                    "name": "prestage",
                    "offset": "T-1d",
                    "steps": [{
                        "name": "copy",
                        "worker_id": "mover",
                        "function": "CopyMailbox",
                        "params": {"user": "{{user_id}}"}
                    }]
                },
                {"name": "cutover", "offset": "T-0", "steps": []}
            ]
        })
    }

    #[test]
    fn test_parse_minimal() {
        let spec = RunbookSpec::parse(&minimal_doc().to_string()).unwrap();
        assert_eq!(spec.name, "mailbox_cutover");
        assert_eq!(spec.phases.len(), 2);
        assert_eq!(
            spec.data_source.batch_time_mode().unwrap(),
            BatchTimeMode::Column("cutover_at".to_string())
        );
    }

    #[test]
    fn test_batch_time_column_shorthand() {
        let mut doc = minimal_doc();
        doc["data_source"]["batch_time"] = json!("column:cutover_at");
        doc["data_source"]
            .as_object_mut()
            .unwrap()
            .remove("batch_time_column");
        let spec = RunbookSpec::parse(&doc.to_string()).unwrap();
        assert_eq!(
            spec.data_source.batch_time_mode().unwrap(),
            BatchTimeMode::Column("cutover_at".to_string())
        );
    }

    #[test]
    fn test_primary_key_must_be_projected() {
        let mut doc = minimal_doc();
        doc["data_source"]["primary_key"] = json!("tenant_id");
        assert!(RunbookSpec::parse(&doc.to_string()).is_err());
    }

    #[test]
    fn test_duplicate_phase_rejected() {
        let mut doc = minimal_doc();
        doc["phases"][1]["name"] = json!("prestage");
        assert!(RunbookSpec::parse(&doc.to_string()).is_err());
    }

    #[test]
    fn test_bad_offset_rejected() {
        let mut doc = minimal_doc();
        doc["phases"][0]["offset"] = json!("yesterday");
        assert!(RunbookSpec::parse(&doc.to_string()).is_err());
    }

    #[test]
    fn test_unknown_rollback_reference_rejected() {
        let mut doc = minimal_doc();
        doc["phases"][0]["steps"][0]["on_failure"] = json!("undo");
        assert!(RunbookSpec::parse(&doc.to_string()).is_err());

        doc["rollbacks"] = json!({
            "undo": [{"name": "undo_copy", "worker_id": "mover", "function": "DeleteCopy"}]
        });
        assert!(RunbookSpec::parse(&doc.to_string()).is_ok());
    }

    #[test]
    fn test_init_may_not_use_member_columns() {
        let mut doc = minimal_doc();
        doc["init"] = json!([{
            "name": "announce",
            "worker_id": "notifier",
            "function": "Announce",
            "params": {"batch": "{{_batch_id}}", "who": "{{user_id}}"}
        }]);
        assert!(RunbookSpec::parse(&doc.to_string()).is_err());

        doc["init"] = json!([{
            "name": "announce",
            "worker_id": "notifier",
            "function": "Announce",
            "params": {"batch": "{{_batch_id}}"}
        }]);
        assert!(RunbookSpec::parse(&doc.to_string()).is_ok());
    }

    #[test]
    fn test_effective_retry_falls_back() {
        let mut doc = minimal_doc();
        doc["retry"] = json!({"max_retries": 3, "interval": "30s"});
        let spec = RunbookSpec::parse(&doc.to_string()).unwrap();
        let step = &spec.phases[0].steps[0];
        let retry = spec.effective_retry(step).unwrap();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.interval_secs().unwrap(), 30);
    }

    #[test]
    fn test_referenced_member_columns() {
        let spec = RunbookSpec::parse(&minimal_doc().to_string()).unwrap();
        let cols = spec.referenced_member_columns();
        assert!(cols.contains("user_id"));
        assert!(!cols.iter().any(|c| c.starts_with('_')));
    }

    #[test]
    fn test_multi_valued_parse() {
        assert_eq!(
            MultiValuedFormat::SemicolonDelimited.parse_values("a; b;;c"),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            MultiValuedFormat::CommaDelimited.parse_values("x,y"),
            vec!["x", "y"]
        );
        assert_eq!(
            MultiValuedFormat::JsonArray.parse_values("[\"x\",2]"),
            vec!["x", "2"]
        );
        assert_eq!(
            MultiValuedFormat::JsonArray.parse_values("not json"),
            vec!["not json"]
        );
    }

    #[test]
    fn test_dynamic_table_name() {
        assert_eq!(dynamic_table_name("Mailbox_Cutover", 3), "rbdata_mailbox_cutover_v3");
    }
}
