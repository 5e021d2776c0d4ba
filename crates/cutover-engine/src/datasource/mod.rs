// Data-source query adapters
//
// The scheduler consumes only "a tabular result with named columns of
// string-coercible values"; everything back-end specific lives behind the
// DataSourceClient trait. Connection labels from runbook specifications are
// resolved against a registry configured at wire-up.

pub mod business;
pub mod warehouse;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use cutover_core::DataSourceSpec;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors surfaced by data-source adapters
#[derive(Debug, Error)]
pub enum DataSourceError {
    /// Transport-level failure
    #[error("request error: {0}")]
    Request(String),

    /// The back-end reported a terminal non-success state
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Response shape did not match expectations
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// No client is configured for the connection label
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
}

impl From<reqwest::Error> for DataSourceError {
    fn from(e: reqwest::Error) -> Self {
        DataSourceError::Request(e.to_string())
    }
}

/// One result row: column name → nullable string cell
pub type TableRow = BTreeMap<String, Option<String>>;

/// A tabular query result
#[derive(Debug, Clone, Default)]
pub struct TableResult {
    /// Output columns in projection order
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl TableResult {
    /// Build a result from column names and positional cells.
    pub fn from_positional(columns: Vec<String>, cells: Vec<Vec<Option<String>>>) -> Self {
        let rows = cells
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.into_iter().chain(std::iter::repeat(None)))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }
}

/// Adapter executing a runbook's declared query against one back-end
#[async_trait]
pub trait DataSourceClient: Send + Sync + 'static {
    async fn query(&self, source: &DataSourceSpec) -> Result<TableResult, DataSourceError>;
}

/// Connection-label → client registry built at wire-up
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    clients: HashMap<String, Arc<dyn DataSourceClient>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        connection: impl Into<String>,
        client: Arc<dyn DataSourceClient>,
    ) -> Self {
        self.clients.insert(connection.into(), client);
        self
    }

    pub fn get(&self, connection: &str) -> Result<Arc<dyn DataSourceClient>, DataSourceError> {
        self.clients
            .get(connection)
            .cloned()
            .ok_or_else(|| DataSourceError::UnknownConnection(connection.to_string()))
    }
}

/// Static adapter returning a preconfigured result. Backs tests and local
/// runs without a warehouse.
#[derive(Default)]
pub struct StaticDataSource {
    result: Mutex<TableResult>,
}

impl StaticDataSource {
    pub fn new(result: TableResult) -> Self {
        Self {
            result: Mutex::new(result),
        }
    }

    /// Replace the result returned by subsequent queries.
    pub fn set_result(&self, result: TableResult) {
        *self.result.lock() = result;
    }
}

#[async_trait]
impl DataSourceClient for StaticDataSource {
    async fn query(&self, _source: &DataSourceSpec) -> Result<TableResult, DataSourceError> {
        Ok(self.result.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_positional_pads_short_rows() {
        let result = TableResult::from_positional(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![Some("1".to_string())]],
        );
        assert_eq!(result.rows[0]["a"].as_deref(), Some("1"));
        assert_eq!(result.rows[0]["b"], None);
    }

    #[test]
    fn test_registry_unknown_connection() {
        let registry = DataSourceRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(DataSourceError::UnknownConnection(_))
        ));
    }
}
