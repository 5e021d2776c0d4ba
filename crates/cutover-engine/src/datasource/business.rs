//! Business-database adapter
//!
//! OData-style endpoint: the runbook's query text is a relative resource path
//! (entity set plus query options). Results arrive in pages under `value`
//! with an `@odata.nextLink` continuation; pagination runs until exhausted.

use async_trait::async_trait;
use cutover_core::DataSourceSpec;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{DataSourceClient, DataSourceError, TableResult, TableRow};

/// Configuration for one business-database connection
#[derive(Debug, Clone)]
pub struct BusinessDbConfig {
    /// Service root, e.g. `https://erp.example.com/api/data/v9.2`
    pub base_url: String,
    /// Bearer token
    pub token: String,
}

impl BusinessDbConfig {
    /// Read a connection's configuration from `CUTOVER_BUSINESSDB_<LABEL>_*`
    /// environment variables.
    pub fn from_env(label: &str) -> Result<Self, DataSourceError> {
        let upper = label.to_ascii_uppercase();
        let var = |suffix: &str| {
            let name = format!("CUTOVER_BUSINESSDB_{upper}_{suffix}");
            std::env::var(&name)
                .map_err(|_| DataSourceError::Request(format!("{name} not set")))
        };
        Ok(Self {
            base_url: var("URL")?,
            token: var("TOKEN")?,
        })
    }
}

/// Business-database client
pub struct BusinessDbClient {
    client: Client,
    config: BusinessDbConfig,
}

#[derive(Debug, Deserialize)]
struct ODataPage {
    #[serde(default)]
    value: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

impl BusinessDbClient {
    pub fn new(config: BusinessDbConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn row_from_object(object: serde_json::Map<String, serde_json::Value>) -> TableRow {
        object
            .into_iter()
            .filter(|(key, _)| !key.starts_with("@odata"))
            .map(|(key, value)| {
                let cell = match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                };
                (key, cell)
            })
            .collect()
    }
}

#[async_trait]
impl DataSourceClient for BusinessDbClient {
    async fn query(&self, source: &DataSourceSpec) -> Result<TableResult, DataSourceError> {
        let mut url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            source.query.trim_start_matches('/')
        );
        let mut rows: Vec<TableRow> = Vec::new();
        let mut pages = 0usize;

        loop {
            let page: ODataPage = self
                .client
                .get(&url)
                .bearer_auth(&self.config.token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            pages += 1;
            rows.extend(page.value.into_iter().map(Self::row_from_object));

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(pages, rows = rows.len(), "business-db query paginated");

        let columns = rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        Ok(TableResult { columns, rows })
    }
}
