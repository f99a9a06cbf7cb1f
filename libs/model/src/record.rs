//! Machine records and their boundary schema.
//!
//! The inventory service stores machines as loosely-typed documents
//! ([`RawMachineRecord`]). Every document is converted into a
//! [`MachineRecord`] before the controller looks at it; documents missing a
//! name or network address are rejected here rather than deep inside an
//! allocation pass.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::{BASE_INSTALL_ROLE, DEFAULT_ENVIRONMENT, NETWORK_INTERFACES_ROLE};

/// Attribute holding the machine's network address.
const ADDRESS_ATTR: &str = "ipaddress";

/// Attribute holding the in-use marker.
const IN_USE_ATTR: &str = "in_use";

/// Attribute object holding provisioning metadata.
const PROVISIONING_ATTR: &str = "provisioning";

/// Key of the handle inside the provisioning metadata object.
const HANDLE_KEY: &str = "handle";

/// Opaque handle identifying a machine instance in the provisioning service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisioningHandle(String);

impl ProvisioningHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProvisioningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access credentials issued for a machine.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub password: String,
}

impl Credentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Machine document as stored by the inventory service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMachineRecord {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub run_list: Vec<String>,

    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// A validated pool machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRecord {
    /// Unique machine name (inventory identity).
    pub name: String,

    /// Network address used for remote access.
    pub address: String,

    /// Environment the machine currently belongs to.
    pub environment: String,

    /// Ordered role identifiers applied to the machine.
    pub run_list: Vec<String>,

    /// Set while a test run is actively using the machine.
    pub in_use: bool,

    /// Present iff the machine was created through the provisioning service.
    pub provisioning_handle: Option<ProvisioningHandle>,

    /// Attributes the controller does not interpret, preserved on save.
    extra_attributes: Map<String, Value>,
}

impl MachineRecord {
    /// Create a free machine record.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            run_list: Vec::new(),
            in_use: false,
            provisioning_handle: None,
            extra_attributes: Map::new(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_run_list<I, S>(mut self, run_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_list = run_list.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_in_use(mut self, in_use: bool) -> Self {
        self.in_use = in_use;
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.provisioning_handle = Some(ProvisioningHandle::new(handle));
        self
    }

    /// Look up an attribute the controller does not model explicitly.
    pub fn extra_attribute(&self, key: &str) -> Option<&Value> {
        self.extra_attributes.get(key)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.run_list.iter().any(|entry| entry == role)
    }

    /// True once network bring-up has replaced the base install role.
    pub fn is_network_configured(&self) -> bool {
        self.has_role(NETWORK_INTERFACES_ROLE)
    }

    pub fn has_base_install(&self) -> bool {
        self.has_role(BASE_INSTALL_ROLE)
    }

    pub fn in_default_environment(&self) -> bool {
        self.environment == DEFAULT_ENVIRONMENT
    }

    /// Convert back into the inventory document schema.
    pub fn to_raw(&self) -> RawMachineRecord {
        let mut attributes = self.extra_attributes.clone();
        attributes.insert(ADDRESS_ATTR.to_string(), Value::from(self.address.clone()));
        attributes.insert(IN_USE_ATTR.to_string(), Value::from(u8::from(self.in_use)));
        if let Some(handle) = &self.provisioning_handle {
            let mut provisioning = match attributes.remove(PROVISIONING_ATTR) {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            provisioning.insert(HANDLE_KEY.to_string(), Value::from(handle.as_str()));
            attributes.insert(PROVISIONING_ATTR.to_string(), Value::Object(provisioning));
        }

        RawMachineRecord {
            name: Some(self.name.clone()),
            environment: Some(self.environment.clone()),
            run_list: self.run_list.clone(),
            attributes,
        }
    }
}

impl fmt::Display for MachineRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

impl TryFrom<RawMachineRecord> for MachineRecord {
    type Error = ModelError;

    fn try_from(raw: RawMachineRecord) -> Result<Self, Self::Error> {
        let name = raw
            .name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ModelError::MissingField {
                record: "<unnamed>".to_string(),
                field: "name",
            })?;

        let mut attributes = raw.attributes;

        let address = match attributes.remove(ADDRESS_ATTR) {
            Some(Value::String(address)) if !address.is_empty() => address,
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return Err(ModelError::MissingField {
                    record: name,
                    field: ADDRESS_ATTR,
                });
            }
            Some(_) => {
                return Err(ModelError::InvalidAttribute {
                    record: name,
                    field: ADDRESS_ATTR,
                });
            }
        };

        let in_use = match attributes.remove(IN_USE_ATTR) {
            None => false,
            Some(value) => parse_in_use(&value).ok_or_else(|| ModelError::InvalidAttribute {
                record: name.clone(),
                field: IN_USE_ATTR,
            })?,
        };

        let provisioning_handle = match attributes.get_mut(PROVISIONING_ATTR) {
            Some(Value::Object(provisioning)) => match provisioning.remove(HANDLE_KEY) {
                Some(Value::String(handle)) if !handle.is_empty() => {
                    Some(ProvisioningHandle(handle))
                }
                Some(Value::String(_)) | Some(Value::Null) | None => None,
                Some(_) => {
                    return Err(ModelError::InvalidAttribute {
                        record: name,
                        field: "provisioning.handle",
                    });
                }
            },
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(ModelError::InvalidAttribute {
                    record: name,
                    field: PROVISIONING_ATTR,
                });
            }
        };

        // Drop an emptied provisioning object so it does not round-trip as `{}`.
        if matches!(attributes.get(PROVISIONING_ATTR), Some(Value::Object(map)) if map.is_empty())
        {
            attributes.remove(PROVISIONING_ATTR);
        }

        Ok(Self {
            name,
            address,
            environment: raw
                .environment
                .filter(|env| !env.is_empty())
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            run_list: raw.run_list,
            in_use,
            provisioning_handle,
            extra_attributes: attributes,
        })
    }
}

/// The in-use marker has been written as booleans, integers and strings
/// over time; anything other than an explicit zero/false counts as in use.
fn parse_in_use(value: &Value) -> Option<bool> {
    match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => {
            let s = s.trim();
            Some(!(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")))
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawMachineRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_record_converts() {
        let record = MachineRecord::try_from(raw(json!({
            "name": "qa-centos-pool1",
            "environment": "envA",
            "run_list": ["recipe[network-interfaces]"],
            "attributes": {
                "ipaddress": "10.0.0.5",
                "in_use": 0,
                "platform_family": "rhel",
                "provisioning": {"handle": "am-123"}
            }
        })))
        .unwrap();

        assert_eq!(record.name, "qa-centos-pool1");
        assert_eq!(record.address, "10.0.0.5");
        assert_eq!(record.environment, "envA");
        assert!(!record.in_use);
        assert!(record.is_network_configured());
        assert_eq!(
            record.provisioning_handle,
            Some(ProvisioningHandle::new("am-123"))
        );
        assert_eq!(record.extra_attribute("platform_family"), Some(&json!("rhel")));
    }

    #[test]
    fn test_missing_environment_defaults() {
        let record = MachineRecord::try_from(raw(json!({
            "name": "qa-centos-pool1",
            "attributes": {"ipaddress": "10.0.0.5"}
        })))
        .unwrap();

        assert_eq!(record.environment, DEFAULT_ENVIRONMENT);
        assert!(record.provisioning_handle.is_none());
    }

    #[test]
    fn test_missing_name_rejected() {
        let err = MachineRecord::try_from(raw(json!({
            "attributes": {"ipaddress": "10.0.0.5"}
        })))
        .unwrap_err();

        assert!(err.is_record_error());
        assert!(matches!(err, ModelError::MissingField { field: "name", .. }));
    }

    #[test]
    fn test_missing_address_rejected() {
        let err = MachineRecord::try_from(raw(json!({"name": "qa-centos-pool1"}))).unwrap_err();
        assert_eq!(
            err,
            ModelError::MissingField {
                record: "qa-centos-pool1".to_string(),
                field: "ipaddress"
            }
        );
    }

    #[test]
    fn test_non_string_handle_rejected() {
        let err = MachineRecord::try_from(raw(json!({
            "name": "n1",
            "attributes": {"ipaddress": "10.0.0.5", "provisioning": {"handle": 7}}
        })))
        .unwrap_err();
        assert!(matches!(err, ModelError::InvalidAttribute { .. }));
    }

    #[rstest]
    #[case(json!(0), false)]
    #[case(json!(1), true)]
    #[case(json!(true), true)]
    #[case(json!(false), false)]
    #[case(json!("0"), false)]
    #[case(json!(""), false)]
    #[case(json!("chef_server"), true)]
    #[case(json!(null), false)]
    fn test_in_use_variants(#[case] value: serde_json::Value, #[case] expected: bool) {
        let record = MachineRecord::try_from(raw(json!({
            "name": "n1",
            "attributes": {"ipaddress": "10.0.0.5", "in_use": value}
        })))
        .unwrap();
        assert_eq!(record.in_use, expected);
    }

    #[test]
    fn test_to_raw_preserves_unmodelled_attributes() {
        let original = raw(json!({
            "name": "n1",
            "environment": "_default",
            "run_list": ["role[qa-base]"],
            "attributes": {
                "ipaddress": "10.0.0.5",
                "platform_family": "debian",
                "provisioning": {"handle": "am-1", "broker": "chef"}
            }
        }));
        let mut record = MachineRecord::try_from(original).unwrap();
        record.in_use = true;

        let back = record.to_raw();
        assert_eq!(back.attributes["platform_family"], json!("debian"));
        assert_eq!(back.attributes["in_use"], json!(1));
        assert_eq!(
            back.attributes["provisioning"],
            json!({"handle": "am-1", "broker": "chef"})
        );
        assert_eq!(MachineRecord::try_from(back).unwrap(), record);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
