//! Bare-metal provisioning service client.
//!
//! The provisioning service boots machines into an image, issues their root
//! credentials and tracks each booted machine as an "active model" keyed by
//! a [`ProvisioningHandle`]. Releasing the handle returns the hardware to
//! the provisioner, which re-images it on next boot.

use async_trait::async_trait;
use reqwest::Url;
use rigpool_model::{Credentials, ProvisioningHandle};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientResult;
use crate::http::{build_client, check, endpoint, parse_base};

const SERVICE: &str = "provisioner";

/// Request to create a new machine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRequest {
    pub name: String,
    pub image_tag: String,
}

/// A machine tracked by the provisioning service under a policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveModel {
    pub handle: ProvisioningHandle,

    /// Provisioner-reported state, e.g. `broker_success` or `broker_fail`.
    pub current_state: String,

    /// Address the provisioner assigned, if it got that far.
    #[serde(default)]
    pub address: Option<String>,
}

impl ActiveModel {
    /// True if the provisioner gave up handing the machine to its broker.
    pub fn is_broker_failed(&self) -> bool {
        self.current_state.contains("broker_fail")
    }
}

#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn create_instance(&self, request: &InstanceRequest) -> ClientResult<ProvisioningHandle>;

    async fn credentials(&self, handle: &ProvisioningHandle) -> ClientResult<Credentials>;

    /// Release the handle. Fails with `NotFound` if it is unknown.
    async fn release(&self, handle: &ProvisioningHandle) -> ClientResult<()>;

    async fn active_models(&self, policy: &str) -> ClientResult<Vec<ActiveModel>>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    handle: ProvisioningHandle,
}

#[derive(Debug, Deserialize)]
struct ActiveModelsResponse {
    #[serde(default)]
    models: Vec<ActiveModel>,
}

/// Provisioning client speaking the service's JSON API.
pub struct HttpProvisioningClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpProvisioningClient {
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
impl ProvisioningClient for HttpProvisioningClient {
    async fn create_instance(&self, request: &InstanceRequest) -> ClientResult<ProvisioningHandle> {
        debug!(name = %request.name, image_tag = %request.image_tag, "Creating instance");
        let response = self
            .client
            .post(self.url(&["instances"]))
            .json(request)
            .send()
            .await?;
        let response = check(response, SERVICE, "image", &request.image_tag).await?;
        let body: CreateResponse = response.json().await?;
        Ok(body.handle)
    }

    async fn credentials(&self, handle: &ProvisioningHandle) -> ClientResult<Credentials> {
        let response = self
            .client
            .get(self.url(&["active_models", handle.as_str(), "password"]))
            .send()
            .await?;
        let response = check(response, SERVICE, "active model", handle.as_str()).await?;
        Ok(response.json().await?)
    }

    async fn release(&self, handle: &ProvisioningHandle) -> ClientResult<()> {
        debug!(handle = %handle, "Releasing active model");
        let response = self
            .client
            .delete(self.url(&["active_models", handle.as_str()]))
            .send()
            .await?;
        check(response, SERVICE, "active model", handle.as_str()).await?;
        Ok(())
    }

    async fn active_models(&self, policy: &str) -> ClientResult<Vec<ActiveModel>> {
        let response = self
            .client
            .get(self.url(&["active_models"]))
            .query(&[("policy", policy)])
            .send()
            .await?;
        let response = check(response, SERVICE, "policy", policy).await?;
        let body: ActiveModelsResponse = response.json().await?;
        Ok(body.models)
    }
}
