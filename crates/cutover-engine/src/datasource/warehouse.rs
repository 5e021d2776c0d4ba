//! SQL-warehouse adapter
//!
//! The warehouse exposes an asynchronous statement REST API: submit the
//! statement, poll while it reports pending/running, then convert the row
//! array of the succeeded result. Terminal non-success states surface as
//! errors.

use std::time::Duration;

use async_trait::async_trait;
use cutover_core::DataSourceSpec;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{DataSourceClient, DataSourceError, TableResult};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for one warehouse connection
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Base URL, e.g. `https://warehouse.example.com`
    pub base_url: String,
    /// Bearer token
    pub token: String,
    /// Warehouse to execute against
    pub warehouse_id: String,
}

impl WarehouseConfig {
    /// Read a connection's configuration from `CUTOVER_WAREHOUSE_<LABEL>_*`
    /// environment variables.
    pub fn from_env(label: &str) -> Result<Self, DataSourceError> {
        let upper = label.to_ascii_uppercase();
        let var = |suffix: &str| {
            let name = format!("CUTOVER_WAREHOUSE_{upper}_{suffix}");
            std::env::var(&name)
                .map_err(|_| DataSourceError::Request(format!("{name} not set")))
        };
        Ok(Self {
            base_url: var("URL")?,
            token: var("TOKEN")?,
            warehouse_id: var("WAREHOUSE_ID")?,
        })
    }
}

/// SQL-warehouse client
pub struct WarehouseClient {
    client: Client,
    config: WarehouseConfig,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: Schema,
}

#[derive(Debug, Deserialize)]
struct Schema {
    columns: Vec<SchemaColumn>,
}

#[derive(Debug, Deserialize)]
struct SchemaColumn {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct StatementResult {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
}

impl WarehouseClient {
    pub fn new(config: WarehouseConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn submit(&self, query: &str) -> Result<StatementResponse, DataSourceError> {
        let url = format!("{}/api/2.0/sql/statements", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&json!({
                "statement": query,
                "warehouse_id": self.config.warehouse_id,
                "wait_timeout": "0s",
            }))
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    async fn fetch(&self, statement_id: &str) -> Result<StatementResponse, DataSourceError> {
        let url = format!(
            "{}/api/2.0/sql/statements/{statement_id}",
            self.config.base_url
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    fn into_table(response: StatementResponse) -> Result<TableResult, DataSourceError> {
        let manifest = response.manifest.ok_or_else(|| {
            DataSourceError::MalformedResponse("succeeded statement has no manifest".to_string())
        })?;
        let columns: Vec<String> = manifest
            .schema
            .columns
            .into_iter()
            .map(|c| c.name)
            .collect();
        let cells = response.result.unwrap_or_default().data_array;
        Ok(TableResult::from_positional(columns, cells))
    }
}

#[async_trait]
impl DataSourceClient for WarehouseClient {
    async fn query(&self, source: &DataSourceSpec) -> Result<TableResult, DataSourceError> {
        let mut response = self.submit(&source.query).await?;

        loop {
            match response.status.state.as_str() {
                "SUCCEEDED" => {
                    debug!(
                        statement_id = %response.statement_id,
                        "warehouse statement succeeded"
                    );
                    return Self::into_table(response);
                }
                "PENDING" | "RUNNING" => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    let statement_id = response.statement_id.clone();
                    response = self.fetch(&statement_id).await?;
                }
                other => {
                    let message = response
                        .status
                        .error
                        .map(|e| e.message)
                        .unwrap_or_default();
                    return Err(DataSourceError::QueryFailed(format!(
                        "statement entered state {other}: {message}"
                    )));
                }
            }
        }
    }
}
