//! Environment records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::PACKAGE_COMPONENT_KEY;

/// A named grouping that machines are assigned to for a test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Attributes layered over every member machine's configuration.
    #[serde(default)]
    pub override_attributes: Map<String, Value>,
}

impl EnvironmentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Merge a fragment into the overrides; keys in `fragment` win.
    pub fn merge_overrides(&mut self, fragment: &Map<String, Value>) {
        for (key, value) in fragment {
            self.override_attributes.insert(key.clone(), value.clone());
        }
    }

    pub fn package_component(&self) -> Option<&str> {
        self.override_attributes
            .get(PACKAGE_COMPONENT_KEY)
            .and_then(Value::as_str)
    }

    pub fn set_package_component(&mut self, branch: &str) {
        self.override_attributes
            .insert(PACKAGE_COMPONENT_KEY.to_string(), Value::from(branch));
    }

    /// Set a nested override, creating (or replacing non-object) parents.
    pub fn set_override_path(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };

        let mut current = &mut self.override_attributes;
        for key in parents {
            let entry = current
                .entry((*key).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just replaced with an object"),
            };
        }
        current.insert((*last).to_string(), value);
    }

    pub fn override_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.override_attributes.get(*first)?, |value, key| {
                value.get(*key)
            })
    }
}
