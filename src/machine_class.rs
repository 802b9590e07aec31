//! Machine class registry.
//!
//! Classes map a name to the resources a machine of that class gets. Served
//! through the Machine Runtime `Status` call and used to resolve resources
//! at machine creation.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineClass {
    pub name: String,
    pub cpu_millis: i64,
    pub memory_bytes: u64,
}

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("multiple machine classes named {name:?}"))]
    DuplicateClass { name: String },

    #[snafu(display("failed to read machine classes file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse machine classes file {}: {source}", path.display()))]
    ParseFile { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Default)]
pub struct MachineClassRegistry {
    classes: BTreeMap<String, MachineClass>,
}

impl MachineClassRegistry {
    pub fn new(classes: Vec<MachineClass>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for class in classes {
            if map.contains_key(&class.name) {
                return DuplicateClassSnafu { name: class.name }.fail();
            }
            map.insert(class.name.clone(), class);
        }
        Ok(Self { classes: map })
    }

    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read(path).context(ReadFileSnafu { path })?;
        let classes: Vec<MachineClass> =
            serde_json::from_slice(&raw).context(ParseFileSnafu { path })?;
        Self::new(classes)
    }

    pub fn get(&self, name: &str) -> Option<&MachineClass> {
        self.classes.get(name)
    }

    pub fn list(&self) -> Vec<MachineClass> {
        self.classes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> MachineClass {
        MachineClass {
            name: name.into(),
            cpu_millis: 2000,
            memory_bytes: 2 << 30,
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = MachineClassRegistry::new(vec![class("c1"), class("c1")]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateClass { .. }));
    }

    #[test]
    fn lookup_and_list() {
        let registry = MachineClassRegistry::new(vec![class("small"), class("large")]).unwrap();
        assert!(registry.get("small").is_some());
        assert!(registry.get("absent").is_none());
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        std::fs::write(
            &path,
            r#"[{"name":"small","cpu_millis":1000,"memory_bytes":1073741824}]"#,
        )
        .unwrap();
        let registry = MachineClassRegistry::from_file(&path).unwrap();
        assert_eq!(registry.get("small").unwrap().cpu_millis, 1000);
    }
}
