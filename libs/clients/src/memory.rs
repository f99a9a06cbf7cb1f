//! In-memory collaborators for development and tests.
//!
//! Each implementation records the calls made against it so callers can
//! assert on query counts, deletions, releases and command ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rigpool_model::{Credentials, EnvironmentRecord, MachineRecord, ProvisioningHandle, Query};
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::exec::{CommandOutput, RemoteExec, RemoteTarget};
use crate::inventory::InventoryClient;
use crate::provisioning::{ActiveModel, InstanceRequest, ProvisioningClient};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Debug, Default)]
struct InventoryState {
    /// Machines in insertion order; search results follow this order.
    machines: Vec<MachineRecord>,
    clients: BTreeSet<String>,
    environments: BTreeMap<String, EnvironmentRecord>,
    /// Number of upcoming searches that see an empty, not-yet-updated index.
    stale_searches: usize,
    fail_searches: bool,
    failing_saves: HashSet<String>,
    query_count: usize,
    machine_saves: Vec<String>,
    deleted_machines: Vec<String>,
    deleted_clients: Vec<String>,
}

/// Inventory backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: Mutex<InventoryState>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a machine (and its API client registration) without recording a save.
    pub fn insert_machine(&self, record: MachineRecord) {
        let mut state = lock(&self.state);
        state.clients.insert(record.name.clone());
        upsert(&mut state.machines, record);
    }

    pub fn insert_environment(&self, environment: EnvironmentRecord) {
        lock(&self.state)
            .environments
            .insert(environment.name.clone(), environment);
    }

    /// Make the next `count` searches return an empty result.
    pub fn set_stale_searches(&self, count: usize) {
        lock(&self.state).stale_searches = count;
    }

    /// Make every search fail with a service error.
    pub fn set_fail_searches(&self, fail: bool) {
        lock(&self.state).fail_searches = fail;
    }

    /// Make every save of the named machine fail with a 500.
    pub fn fail_saves_for(&self, name: &str) {
        lock(&self.state).failing_saves.insert(name.to_string());
    }

    pub fn machine(&self, name: &str) -> Option<MachineRecord> {
        lock(&self.state)
            .machines
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    pub fn machines(&self) -> Vec<MachineRecord> {
        lock(&self.state).machines.clone()
    }

    pub fn environment(&self, name: &str) -> Option<EnvironmentRecord> {
        lock(&self.state).environments.get(name).cloned()
    }

    pub fn has_client(&self, name: &str) -> bool {
        lock(&self.state).clients.contains(name)
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state).query_count
    }

    /// Names of machines saved through the client, in save order.
    pub fn machine_saves(&self) -> Vec<String> {
        lock(&self.state).machine_saves.clone()
    }

    pub fn deleted_machines(&self) -> Vec<String> {
        lock(&self.state).deleted_machines.clone()
    }

    pub fn deleted_clients(&self) -> Vec<String> {
        lock(&self.state).deleted_clients.clone()
    }
}

fn upsert(machines: &mut Vec<MachineRecord>, record: MachineRecord) {
    match machines.iter_mut().find(|m| m.name == record.name) {
        Some(existing) => *existing = record,
        None => machines.push(record),
    }
}

#[async_trait]
impl InventoryClient for MemoryInventory {
    async fn query(&self, query: &Query) -> ClientResult<Vec<MachineRecord>> {
        let mut state = lock(&self.state);
        state.query_count += 1;

        if state.fail_searches {
            return Err(ClientError::Status {
                service: "inventory",
                status: 503,
                body: "search index unavailable".to_string(),
            });
        }
        if state.stale_searches > 0 {
            state.stale_searches -= 1;
            debug!(query = %query, "Serving stale (empty) search");
            return Ok(Vec::new());
        }

        Ok(state
            .machines
            .iter()
            .filter(|m| query.matches(m))
            .cloned()
            .collect())
    }

    async fn get_machine(&self, name: &str) -> ClientResult<Option<MachineRecord>> {
        Ok(self.machine(name))
    }

    async fn save_machine(&self, record: &MachineRecord) -> ClientResult<()> {
        let mut state = lock(&self.state);
        if state.failing_saves.contains(&record.name) {
            return Err(ClientError::Status {
                service: "inventory",
                status: 500,
                body: format!("cannot save {}", record.name),
            });
        }
        state.machine_saves.push(record.name.clone());
        upsert(&mut state.machines, record.clone());
        Ok(())
    }

    async fn delete_machine(&self, name: &str) -> ClientResult<()> {
        let mut state = lock(&self.state);
        let before = state.machines.len();
        state.machines.retain(|m| m.name != name);
        if state.machines.len() == before {
            return Err(ClientError::not_found("machine", name));
        }
        state.deleted_machines.push(name.to_string());
        Ok(())
    }

    async fn delete_client(&self, name: &str) -> ClientResult<()> {
        let mut state = lock(&self.state);
        if !state.clients.remove(name) {
            return Err(ClientError::not_found("client", name));
        }
        state.deleted_clients.push(name.to_string());
        Ok(())
    }

    async fn get_environment(&self, name: &str) -> ClientResult<Option<EnvironmentRecord>> {
        Ok(self.environment(name))
    }

    async fn save_environment(&self, environment: &EnvironmentRecord) -> ClientResult<()> {
        self.insert_environment(environment.clone());
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> ClientResult<()> {
        lock(&self.state)
            .environments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::not_found("environment", name))
    }
}

// =============================================================================
// Provisioning
// =============================================================================

#[derive(Debug)]
struct Model {
    policy: String,
    model: ActiveModel,
    password: String,
}

#[derive(Debug, Default)]
struct ProvisionerState {
    models: BTreeMap<ProvisioningHandle, Model>,
    created: Vec<InstanceRequest>,
    released: Vec<ProvisioningHandle>,
    credential_requests: usize,
    fail_releases: bool,
}

/// Provisioning service backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    state: Mutex<ProvisionerState>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a booted machine under the default policy.
    pub fn add_model(&self, handle: &str, password: &str) {
        self.add_active_model(
            "default",
            ActiveModel {
                handle: ProvisioningHandle::new(handle),
                current_state: "broker_success".to_string(),
                address: None,
            },
            password,
        );
    }

    pub fn add_active_model(&self, policy: &str, model: ActiveModel, password: &str) {
        lock(&self.state).models.insert(
            model.handle.clone(),
            Model {
                policy: policy.to_string(),
                model,
                password: password.to_string(),
            },
        );
    }

    pub fn set_fail_releases(&self, fail: bool) {
        lock(&self.state).fail_releases = fail;
    }

    pub fn is_active(&self, handle: &str) -> bool {
        lock(&self.state)
            .models
            .contains_key(&ProvisioningHandle::new(handle))
    }

    pub fn released(&self) -> Vec<ProvisioningHandle> {
        lock(&self.state).released.clone()
    }

    pub fn created(&self) -> Vec<InstanceRequest> {
        lock(&self.state).created.clone()
    }

    pub fn credential_requests(&self) -> usize {
        lock(&self.state).credential_requests
    }
}

#[async_trait]
impl ProvisioningClient for MemoryProvisioner {
    async fn create_instance(&self, request: &InstanceRequest) -> ClientResult<ProvisioningHandle> {
        let mut state = lock(&self.state);
        state.created.push(request.clone());
        let handle = ProvisioningHandle::new(format!("am-{}", state.created.len()));
        state.models.insert(
            handle.clone(),
            Model {
                policy: request.image_tag.clone(),
                model: ActiveModel {
                    handle: handle.clone(),
                    current_state: "init".to_string(),
                    address: None,
                },
                password: format!("pw-{handle}"),
            },
        );
        Ok(handle)
    }

    async fn credentials(&self, handle: &ProvisioningHandle) -> ClientResult<Credentials> {
        let mut state = lock(&self.state);
        state.credential_requests += 1;
        state
            .models
            .get(handle)
            .map(|m| Credentials::new(m.password.clone()))
            .ok_or_else(|| ClientError::not_found("active model", handle.as_str()))
    }

    async fn release(&self, handle: &ProvisioningHandle) -> ClientResult<()> {
        let mut state = lock(&self.state);
        if state.fail_releases {
            return Err(ClientError::Status {
                service: "provisioner",
                status: 500,
                body: "release failed".to_string(),
            });
        }
        if state.models.remove(handle).is_none() {
            return Err(ClientError::not_found("active model", handle.as_str()));
        }
        state.released.push(handle.clone());
        Ok(())
    }

    async fn active_models(&self, policy: &str) -> ClientResult<Vec<ActiveModel>> {
        Ok(lock(&self.state)
            .models
            .values()
            .filter(|m| m.policy == policy)
            .map(|m| m.model.clone())
            .collect())
    }
}

// =============================================================================
// Remote exec
// =============================================================================

/// A remote operation recorded by [`ScriptedExec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCall {
    Run { address: String, command: String },
    CopyTo { address: String, remote: String },
    CopyFrom { address: String, remote: String },
}

#[derive(Debug, Default)]
struct ExecState {
    calls: Vec<ExecCall>,
    failing: HashSet<String>,
    scripted: HashMap<String, VecDeque<bool>>,
}

/// Remote exec that succeeds unless told otherwise.
///
/// Per-address outcomes queued with [`ScriptedExec::push_outcomes`] are
/// consumed first; after that, addresses marked with
/// [`ScriptedExec::fail_address`] fail and everything else succeeds.
#[derive(Debug, Default)]
pub struct ScriptedExec {
    state: Mutex<ExecState>,
}

impl ScriptedExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_address(&self, address: &str) {
        lock(&self.state).failing.insert(address.to_string());
    }

    pub fn push_outcomes(&self, address: &str, outcomes: impl IntoIterator<Item = bool>) {
        lock(&self.state)
            .scripted
            .entry(address.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        lock(&self.state).calls.clone()
    }

    /// Commands run against one address, in order.
    pub fn commands_for(&self, address: &str) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                ExecCall::Run {
                    address: a,
                    command,
                } if a == address => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    fn outcome(&self, call: ExecCall, address: &str) -> CommandOutput {
        let mut state = lock(&self.state);
        state.calls.push(call);

        let scripted = state
            .scripted
            .get_mut(address)
            .and_then(VecDeque::pop_front);
        let success = scripted.unwrap_or_else(|| !state.failing.contains(address));

        if success {
            CommandOutput::succeeded("")
        } else {
            CommandOutput::failed(255, format!("ssh: connect to host {address}: No route to host"))
        }
    }
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn run(&self, target: &RemoteTarget, command: &str) -> ClientResult<CommandOutput> {
        let call = ExecCall::Run {
            address: target.address.clone(),
            command: command.to_string(),
        };
        Ok(self.outcome(call, &target.address))
    }

    async fn copy_to(
        &self,
        target: &RemoteTarget,
        _local: &Path,
        remote: &str,
    ) -> ClientResult<CommandOutput> {
        let call = ExecCall::CopyTo {
            address: target.address.clone(),
            remote: remote.to_string(),
        };
        Ok(self.outcome(call, &target.address))
    }

    async fn copy_from(
        &self,
        target: &RemoteTarget,
        remote: &str,
        _local: &Path,
    ) -> ClientResult<CommandOutput> {
        let call = ExecCall::CopyFrom {
            address: target.address.clone(),
            remote: remote.to_string(),
        };
        Ok(self.outcome(call, &target.address))
    }
}
