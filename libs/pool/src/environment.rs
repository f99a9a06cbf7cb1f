//! Environment management.
//!
//! An environment is a named group of machines plus override attributes
//! layered over their configuration. `prepare` is the only way one is
//! created, and it always re-merges the attribute set so repeated calls
//! converge on the same state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rigpool_clients::InventoryClient;
use rigpool_model::{EnvironmentRecord, Field, MachineRecord, Query, DEFAULT_ENVIRONMENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{PoolError, PoolResult};
use crate::lifecycle::NodeLifecycleController;
use crate::search::{RetrySearch, SearchOutcome};

/// Run-list pattern identifying a directory (LDAP) server.
pub const DIRECTORY_SERVER_PATTERN: &str = "*qa-openldap*";

// =============================================================================
// Feature catalog
// =============================================================================

/// Attribute fragments merged into environments.
///
/// ```toml
/// [base]
/// package_component = "master"
///
/// [features.ldap.keystone]
/// auth_type = "ldap"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeatureCatalog {
    #[serde(default)]
    base: Map<String, Value>,

    #[serde(default)]
    features: BTreeMap<String, Map<String, Value>>,
}

impl FeatureCatalog {
    pub fn new(base: Map<String, Value>) -> Self {
        Self {
            base,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, fragment: Map<String, Value>) -> Self {
        self.features.insert(name.into(), fragment);
        self
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let table: toml::Table = toml::from_str(s)?;
        let value = serde_json::to_value(table)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn base(&self) -> &Map<String, Value> {
        &self.base
    }

    pub fn fragment(&self, feature: &str) -> Option<&Map<String, Value>> {
        self.features.get(feature)
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}

/// Composite environment name: `name-os-branch[-feature...]`.
///
/// Features keep their given order, since that order also decides merge
/// precedence.
pub fn environment_name(name: &str, os: &str, branch: &str, features: &[String]) -> String {
    let mut parts = vec![name, os, branch];
    parts.extend(features.iter().map(String::as_str));
    parts.join("-")
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentCleanupReport {
    pub environment: String,
    /// Idle machines returned to the default environment.
    pub released: Vec<String>,
    /// In-use machines erased.
    pub erased: Vec<String>,
    pub failed: Vec<MachineFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineFailure {
    pub machine: String,
    pub reason: String,
}

// =============================================================================
// Manager
// =============================================================================

pub struct EnvironmentManager {
    inventory: Arc<dyn InventoryClient>,
    search: RetrySearch,
    catalog: FeatureCatalog,
}

impl EnvironmentManager {
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        search: RetrySearch,
        catalog: FeatureCatalog,
    ) -> Self {
        Self {
            inventory,
            search,
            catalog,
        }
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    /// Create or refresh an environment and return its name.
    ///
    /// The base fragment is merged first, then each feature in order, then
    /// `package_component` is set to `branch`.
    #[instrument(skip(self))]
    pub async fn prepare(
        &self,
        name: &str,
        os: &str,
        branch: &str,
        features: &[String],
    ) -> PoolResult<String> {
        let env_name = environment_name(name, os, branch, features);

        let mut environment = match self.inventory.get_environment(&env_name).await? {
            Some(existing) => existing,
            None => {
                info!(environment = %env_name, "Creating environment");
                EnvironmentRecord::new(&env_name)
            }
        };

        environment.merge_overrides(self.catalog.base());
        for feature in features {
            match self.catalog.fragment(feature) {
                Some(fragment) => environment.merge_overrides(fragment),
                None => warn!(feature = %feature, "Unknown feature, no attributes merged"),
            }
        }
        environment.set_package_component(branch);

        self.inventory.save_environment(&environment).await?;
        debug!(environment = %env_name, "Environment saved");
        Ok(env_name)
    }

    pub async fn get(&self, name: &str) -> PoolResult<EnvironmentRecord> {
        self.inventory
            .get_environment(name)
            .await?
            .ok_or_else(|| PoolError::not_found("environment", name))
    }

    /// Delete an environment; `NotFound` if it does not exist.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> PoolResult<()> {
        self.inventory.delete_environment(name).await.map_err(|e| {
            if e.is_not_found() {
                PoolError::not_found("environment", name)
            } else {
                e.into()
            }
        })?;
        info!(environment = %name, "Environment deleted");
        Ok(())
    }

    /// Teardown variant of [`delete`](Self::delete): an absent environment
    /// is not an error. Returns whether anything was deleted.
    pub async fn delete_if_present(&self, name: &str) -> PoolResult<bool> {
        match self.delete(name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(environment = %name, "Environment already absent");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Machines currently in an environment.
    ///
    /// An exhausted search is reported as no members.
    pub async fn members(&self, environment: &str) -> PoolResult<Vec<MachineRecord>> {
        self.search_members(Query::environment(environment)).await
    }

    async fn search_members(&self, query: Query) -> PoolResult<Vec<MachineRecord>> {
        match self.search.outcome(&query).await? {
            SearchOutcome::Found(machines) => Ok(machines),
            SearchOutcome::Exhausted { attempts } => {
                debug!(query = %query, attempts, "No members found");
                Ok(Vec::new())
            }
        }
    }

    /// Reclaim an environment's members: in-use machines are erased, idle
    /// ones go back to the default environment.
    ///
    /// Per-machine failures are recorded and do not stop the pass.
    #[instrument(skip(self, lifecycle))]
    pub async fn cleanup(
        &self,
        environment: &str,
        lifecycle: &NodeLifecycleController,
    ) -> PoolResult<EnvironmentCleanupReport> {
        let mut report = EnvironmentCleanupReport {
            environment: environment.to_string(),
            ..EnvironmentCleanupReport::default()
        };

        for mut machine in self.members(environment).await? {
            if machine.in_use {
                match lifecycle.erase(&machine).await {
                    Ok(_) => report.erased.push(machine.name),
                    Err(e) => {
                        warn!(machine = %machine.name, error = %e, "Erase failed during cleanup");
                        report.failed.push(MachineFailure {
                            machine: machine.name,
                            reason: e.to_string(),
                        });
                    }
                }
                continue;
            }

            machine.environment = DEFAULT_ENVIRONMENT.to_string();
            match self.inventory.save_machine(&machine).await {
                Ok(()) => {
                    info!(machine = %machine.name, "Returned machine to the free pool");
                    report.released.push(machine.name);
                }
                Err(e) => {
                    warn!(machine = %machine.name, error = %e, "Could not release machine");
                    report.failed.push(MachineFailure {
                        machine: machine.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Point an environment at its directory server.
    ///
    /// Writes `keystone.ldap.url` (and `keystone.ldap.password` when given)
    /// into the overrides and returns the URL.
    #[instrument(skip(self, password))]
    pub async fn link_directory_server(
        &self,
        environment: &str,
        password: Option<&str>,
    ) -> PoolResult<String> {
        let mut record = self.get(environment).await?;

        let query = Query::environment(environment).and(Field::RunList, DIRECTORY_SERVER_PATTERN);
        let server = self
            .search_members(query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PoolError::not_found("directory server", environment))?;

        let url = format!("ldap://{}", server.address);
        record.set_override_path(&["keystone", "ldap", "url"], Value::from(url.clone()));
        if let Some(password) = password {
            record.set_override_path(&["keystone", "ldap", "password"], Value::from(password));
        }
        self.inventory.save_environment(&record).await?;

        info!(environment = %environment, server = %server.name, url = %url, "Linked directory server");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rigpool_clients::{MemoryInventory, MemoryProvisioner, ScriptedExec};
    use serde_json::json;

    use super::*;
    use crate::backend::ProvisionedBackend;
    use crate::context::PoolContext;
    use crate::lifecycle::LifecycleConfig;
    use crate::search::SearchPolicy;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn catalog() -> FeatureCatalog {
        FeatureCatalog::new(object(json!({"monitoring": {"enabled": false}})))
            .with_feature("a", object(json!({"k": "from-a", "only_a": 1})))
            .with_feature("b", object(json!({"k": "from-b"})))
    }

    fn manager(inventory: &Arc<MemoryInventory>, catalog: FeatureCatalog) -> EnvironmentManager {
        let inventory = Arc::clone(inventory) as Arc<dyn InventoryClient>;
        let search = RetrySearch::new(
            Arc::clone(&inventory),
            SearchPolicy {
                max_tries: 1,
                interval: std::time::Duration::from_secs(1),
            },
        );
        EnvironmentManager::new(inventory, search, catalog)
    }

    fn features(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_environment_name() {
        assert_eq!(
            environment_name("ci", "centos", "grizzly", &features(&["ha", "ldap"])),
            "ci-centos-grizzly-ha-ldap"
        );
        assert_eq!(environment_name("ci", "precise", "master", &[]), "ci-precise-master");
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let inventory = Arc::new(MemoryInventory::new());
        let manager = manager(&inventory, catalog());
        let feats = features(&["a", "b"]);

        let name = manager.prepare("ci", "centos", "grizzly", &feats).await.unwrap();
        let first = inventory.environment(&name).unwrap();
        let again = manager.prepare("ci", "centos", "grizzly", &feats).await.unwrap();
        let second = inventory.environment(&again).unwrap();

        assert_eq!(name, again);
        assert_eq!(first.override_attributes, second.override_attributes);
        assert_eq!(second.package_component(), Some("grizzly"));
    }

    #[tokio::test]
    async fn test_later_feature_wins() {
        let inventory = Arc::new(MemoryInventory::new());
        let manager = manager(&inventory, catalog());

        let name = manager
            .prepare("ci", "centos", "master", &features(&["a", "b"]))
            .await
            .unwrap();
        let env = inventory.environment(&name).unwrap();
        assert_eq!(env.override_attributes["k"], json!("from-b"));
        assert_eq!(env.override_attributes["only_a"], json!(1));
        assert_eq!(env.override_attributes["monitoring"], json!({"enabled": false}));

        let name = manager
            .prepare("ci", "centos", "master", &features(&["b", "a"]))
            .await
            .unwrap();
        let env = inventory.environment(&name).unwrap();
        assert_eq!(env.override_attributes["k"], json!("from-a"));
    }

    #[tokio::test]
    async fn test_prepare_refreshes_existing_environment() {
        let inventory = Arc::new(MemoryInventory::new());
        let mut existing = EnvironmentRecord::new("ci-centos-master-a");
        existing.set_package_component("stale");
        existing
            .override_attributes
            .insert("kept".to_string(), json!(true));
        inventory.insert_environment(existing);

        let manager = manager(&inventory, catalog());
        manager
            .prepare("ci", "centos", "master", &features(&["a"]))
            .await
            .unwrap();

        let env = inventory.environment("ci-centos-master-a").unwrap();
        assert_eq!(env.package_component(), Some("master"));
        assert_eq!(env.override_attributes["kept"], json!(true));
        assert_eq!(env.override_attributes["k"], json!("from-a"));
    }

    #[tokio::test]
    async fn test_unknown_feature_still_names_environment() {
        let inventory = Arc::new(MemoryInventory::new());
        let manager = manager(&inventory, catalog());

        let name = manager
            .prepare("ci", "centos", "master", &features(&["nope"]))
            .await
            .unwrap();

        assert_eq!(name, "ci-centos-master-nope");
        let env = inventory.environment(&name).unwrap();
        assert_eq!(env.package_component(), Some("master"));
        assert!(!env.override_attributes.contains_key("k"));
    }

    #[tokio::test]
    async fn test_delete_missing_environment() {
        let inventory = Arc::new(MemoryInventory::new());
        let manager = manager(&inventory, catalog());

        let err = manager.delete("nope").await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound { kind: "environment", .. }));
        assert!(!manager.delete_if_present("nope").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_erases_in_use_and_releases_idle() {
        let inventory = Arc::new(MemoryInventory::new());
        let provisioner = Arc::new(MemoryProvisioner::new());
        let exec = Arc::new(ScriptedExec::new());
        provisioner.add_model("am-1", "pw");
        inventory.insert_machine(
            MachineRecord::new("busy", "10.0.0.1")
                .with_environment("envA")
                .with_in_use(true)
                .with_handle("am-1"),
        );
        inventory.insert_machine(MachineRecord::new("idle", "10.0.0.2").with_environment("envA"));

        let ctx = PoolContext::new(inventory.clone(), provisioner.clone(), exec.clone());
        let lifecycle = NodeLifecycleController::new(
            ctx,
            Arc::new(ProvisionedBackend::new(provisioner.clone())),
            LifecycleConfig::default(),
        );
        let manager = manager(&inventory, catalog());

        let report = manager.cleanup("envA", &lifecycle).await.unwrap();

        assert_eq!(report.erased, vec!["busy"]);
        assert_eq!(report.released, vec!["idle"]);
        assert!(report.failed.is_empty());
        assert!(inventory.machine("busy").is_none());
        assert!(inventory.machine("idle").unwrap().in_default_environment());
    }

    #[tokio::test]
    async fn test_link_directory_server() {
        let inventory = Arc::new(MemoryInventory::new());
        inventory.insert_environment(EnvironmentRecord::new("envA"));
        inventory.insert_machine(
            MachineRecord::new("ldap1", "10.0.0.9")
                .with_environment("envA")
                .with_run_list(["role[qa-openldap]"]),
        );
        let manager = manager(&inventory, catalog());

        let url = manager
            .link_directory_server("envA", Some("secret"))
            .await
            .unwrap();

        assert_eq!(url, "ldap://10.0.0.9");
        let env = inventory.environment("envA").unwrap();
        assert_eq!(
            env.override_path(&["keystone", "ldap", "url"]),
            Some(&json!("ldap://10.0.0.9"))
        );
        assert_eq!(
            env.override_path(&["keystone", "ldap", "password"]),
            Some(&json!("secret"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_directory_server_requires_server() {
        let inventory = Arc::new(MemoryInventory::new());
        inventory.insert_environment(EnvironmentRecord::new("envA"));
        let manager = manager(&inventory, catalog());

        let err = manager.link_directory_server("envA", None).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::NotFound {
                kind: "directory server",
                ..
            }
        ));
    }

    #[test]
    fn test_catalog_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[base]
package_component = "master"

[base.glance]
image_upload = true

[features.ldap.keystone]
auth_type = "ldap"
"#
        )
        .unwrap();

        let catalog = FeatureCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.base()["glance"], json!({"image_upload": true}));
        assert_eq!(
            catalog.fragment("ldap").unwrap()["keystone"],
            json!({"auth_type": "ldap"})
        );
        assert_eq!(catalog.feature_names().collect::<Vec<_>>(), vec!["ldap"]);
    }

    #[test]
    fn test_catalog_rejects_non_table_feature() {
        assert!(FeatureCatalog::from_toml_str("features = 3").is_err());
    }
}
