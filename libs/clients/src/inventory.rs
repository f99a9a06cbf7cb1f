//! Inventory service client.
//!
//! The inventory is the system of record for machine metadata, environment
//! membership and role assignments. Searches go through an index that is
//! updated asynchronously, so a search issued right after a write may return
//! stale or empty results. Reads and writes by name are consistent.

use async_trait::async_trait;
use reqwest::Url;
use rigpool_model::{EnvironmentRecord, MachineRecord, Query, RawMachineRecord};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::http::{build_client, check, endpoint, parse_base};

const SERVICE: &str = "inventory";

#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Search machines through the (eventually consistent) index.
    async fn query(&self, query: &Query) -> ClientResult<Vec<MachineRecord>>;

    /// Load a machine by name, bypassing the index.
    async fn get_machine(&self, name: &str) -> ClientResult<Option<MachineRecord>>;

    /// Create or replace a machine record.
    async fn save_machine(&self, record: &MachineRecord) -> ClientResult<()>;

    /// Delete a machine record. Fails with `NotFound` if absent.
    async fn delete_machine(&self, name: &str) -> ClientResult<()>;

    /// Delete the API client registered by a machine. Fails with `NotFound`
    /// if absent.
    async fn delete_client(&self, name: &str) -> ClientResult<()>;

    async fn get_environment(&self, name: &str) -> ClientResult<Option<EnvironmentRecord>>;

    /// Create or replace an environment.
    async fn save_environment(&self, environment: &EnvironmentRecord) -> ClientResult<()>;

    /// Delete an environment. Fails with `NotFound` if absent.
    async fn delete_environment(&self, name: &str) -> ClientResult<()>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<RawMachineRecord>,
}

/// Convert search rows, dropping documents that fail validation.
fn accept_rows(rows: Vec<RawMachineRecord>) -> Vec<MachineRecord> {
    rows.into_iter()
        .filter_map(|raw| match MachineRecord::try_from(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Skipping inventory record");
                None
            }
        })
        .collect()
}

/// Inventory client speaking the service's JSON API.
pub struct HttpInventoryClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpInventoryClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: parse_base(&base_url.into())?,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        endpoint(&self.base_url, segments)
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn query(&self, query: &Query) -> ClientResult<Vec<MachineRecord>> {
        let q = query.to_string();
        debug!(query = %q, "Searching inventory");

        let response = self
            .client
            .get(self.url(&["search", "node"]))
            .query(&[("q", q.as_str())])
            .send()
            .await?;
        let response = check(response, SERVICE, "search index", "node").await?;
        let body: SearchResponse = response.json().await?;

        let records = accept_rows(body.rows);
        debug!(query = %q, count = records.len(), "Inventory search returned");
        Ok(records)
    }

    async fn get_machine(&self, name: &str) -> ClientResult<Option<MachineRecord>> {
        let response = self
            .client
            .get(self.url(&["nodes", name]))
            .send()
            .await?;
        let response = match check(response, SERVICE, "machine", name).await {
            Ok(response) => response,
            Err(ClientError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let raw: RawMachineRecord = response.json().await?;
        Ok(Some(MachineRecord::try_from(raw)?))
    }

    async fn save_machine(&self, record: &MachineRecord) -> ClientResult<()> {
        debug!(machine = %record.name, environment = %record.environment, "Saving machine");
        let response = self
            .client
            .put(self.url(&["nodes", record.name.as_str()]))
            .json(&record.to_raw())
            .send()
            .await?;
        check(response, SERVICE, "machine", &record.name).await?;
        Ok(())
    }

    async fn delete_machine(&self, name: &str) -> ClientResult<()> {
        let response = self
            .client
            .delete(self.url(&["nodes", name]))
            .send()
            .await?;
        check(response, SERVICE, "machine", name).await?;
        Ok(())
    }

    async fn delete_client(&self, name: &str) -> ClientResult<()> {
        let response = self
            .client
            .delete(self.url(&["clients", name]))
            .send()
            .await?;
        check(response, SERVICE, "client", name).await?;
        Ok(())
    }

    async fn get_environment(&self, name: &str) -> ClientResult<Option<EnvironmentRecord>> {
        let response = self
            .client
            .get(self.url(&["environments", name]))
            .send()
            .await?;
        let response = match check(response, SERVICE, "environment", name).await {
            Ok(response) => response,
            Err(ClientError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(response.json().await?))
    }

    async fn save_environment(&self, environment: &EnvironmentRecord) -> ClientResult<()> {
        debug!(environment = %environment.name, "Saving environment");
        let response = self
            .client
            .put(self.url(&["environments", environment.name.as_str()]))
            .json(environment)
            .send()
            .await?;
        check(response, SERVICE, "environment", &environment.name).await?;
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> ClientResult<()> {
        let response = self
            .client
            .delete(self.url(&["environments", name]))
            .send()
            .await?;
        check(response, SERVICE, "environment", name).await?;
        Ok(())
    }
}
