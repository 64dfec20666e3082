//! Runtime configuration, loaded from JSON. Instance identifiers use the
//! string form `"IpcBinding:<service_id>:<instance_id>:<major>:<minor>"`;
//! a malformed identifier is a contract violation surfaced when the entry
//! is resolved.

use crate::error::{BindingError, BindingResult};
use crate::ids::{
    InstanceSelector, ProvidedServiceInstanceId, RequiredServiceInstanceId,
};
use crate::transport::address::IpcUnicastAddress;
use keel::cred::IntegrityLevel;
use keel::logging;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_integrity() -> IntegrityLevel {
    IntegrityLevel::Low
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidedInstanceConfig {
    pub instance_identifier: String,
    pub address: IpcUnicastAddress,
    #[serde(default = "default_integrity")]
    pub integrity: IntegrityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredInstanceConfig {
    pub service_id: u32,
    pub major_version: u32,
    pub minor_version: u32,
    /// Absent means the wildcard: any instance of the service matches.
    pub instance_id: Option<u32>,
    #[serde(default = "default_integrity")]
    pub integrity: IntegrityLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub socket_dir: Option<PathBuf>,
    #[serde(default)]
    pub provided: Vec<ProvidedInstanceConfig>,
    #[serde(default)]
    pub required: Vec<RequiredInstanceConfig>,
}

impl ProvidedInstanceConfig {
    /// Resolves the identifier string. Terminates the process on a
    /// malformed identifier.
    pub fn provided_id(&self, log: &logging::Logger) -> ProvidedServiceInstanceId {
        ProvidedServiceInstanceId::from_identifier(&self.instance_identifier, log)
    }
}

impl RequiredInstanceConfig {
    pub fn required_id(&self) -> RequiredServiceInstanceId {
        RequiredServiceInstanceId {
            service_id: self.service_id,
            major_version: self.major_version,
            minor_version: self.minor_version,
            instance: match self.instance_id {
                Some(instance_id) => InstanceSelector::Exact(instance_id),
                None => InstanceSelector::Any,
            },
        }
    }
}

impl RuntimeConfig {
    /// Loads the configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> BindingResult<RuntimeConfig> {
        let text = fs::read_to_string(path).map_err(|_| BindingError::JsonLoadingFailure)?;

        serde_json::from_str(&text).map_err(|_| BindingError::JsonParsingFailure)
    }

    /// Configuration entry for a provided instance, if present.
    pub fn find_provided(
        &self,
        provided: &ProvidedServiceInstanceId,
        log: &logging::Logger,
    ) -> Option<&ProvidedInstanceConfig> {
        self.provided
            .iter()
            .find(|entry| entry.provided_id(log) == *provided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG_TEXT: &str = r#"
{
    "socket_dir": "/tmp/ipcbind-test",
    "provided": [
        {
            "instance_identifier": "IpcBinding:7:3:1:0",
            "address": { "domain": 10, "port": 1000 },
            "integrity": "Medium"
        }
    ],
    "required": [
        {
            "service_id": 7,
            "major_version": 1,
            "minor_version": 0,
            "instance_id": null
        }
    ]
}
"#;

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(CONFIG_TEXT.as_bytes()).unwrap();

        let config = RuntimeConfig::load(&path).unwrap();

        assert_eq!(config.socket_dir, Some(PathBuf::from("/tmp/ipcbind-test")));
        assert_eq!(config.provided.len(), 1);
        assert_eq!(config.provided[0].address, IpcUnicastAddress::new(10, 1000));
        assert_eq!(config.provided[0].integrity, IntegrityLevel::Medium);

        let provided = config.provided[0].provided_id(&logging::discard());
        assert_eq!(
            provided,
            ProvidedServiceInstanceId {
                service_id: 7,
                instance_id: 3,
                major_version: 1,
                minor_version: 0,
            }
        );

        let required = config.required[0].required_id();
        assert_eq!(required.instance, InstanceSelector::Any);
        assert!(required.matches(&provided));
    }

    #[test]
    fn test_missing_file_is_loading_failure() {
        let result = RuntimeConfig::load("/nonexistent/config.json");
        assert_eq!(result.err().unwrap(), BindingError::JsonLoadingFailure);
    }

    #[test]
    fn test_invalid_json_is_parsing_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let result = RuntimeConfig::load(&path);
        assert_eq!(result.err().unwrap(), BindingError::JsonParsingFailure);
    }

    #[test]
    fn test_integrity_defaults_to_low() {
        let text = r#"
{
    "provided": [
        {
            "instance_identifier": "IpcBinding:7:3:1:0",
            "address": { "domain": 10, "port": 1000 }
        }
    ]
}
"#;
        let config: RuntimeConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.provided[0].integrity, IntegrityLevel::Low);
        assert!(config.socket_dir.is_none());
    }

    #[test]
    fn test_find_provided() {
        let config: RuntimeConfig = serde_json::from_str(CONFIG_TEXT).unwrap();
        let log = logging::discard();

        let provided = ProvidedServiceInstanceId {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            minor_version: 0,
        };
        assert!(config.find_provided(&provided, &log).is_some());

        let other = ProvidedServiceInstanceId {
            instance_id: 4,
            ..provided
        };
        assert!(config.find_provided(&other, &log).is_none());
    }
}
