// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{DeployError, DeployResult},
    pipeline::is_truthy,
    state::STATE,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

type Section = BTreeMap<String, String>;

/// Sectioned string options. Each `[section]` of a `disco_aws.ini` becomes
/// a top level object and each `key = value` line a string member of it,
/// so
///
/// ```ini
/// [test]
/// env = build
/// command = run_tests.sh
/// ```
///
/// is written as `{"test": {"env": "build", "command": "run_tests.sh"}}`.
/// A fuller example:
///
/// ```json
/// {
///   "disco_aws": { "default_environment": "ci", "default_test_user": "jenkins" },
///   "bake": { "ami_stages": "untested failed tested", "prod_baker": "jenkins" },
///   "test": {
///     "env": "build", "user": "tester",
///     "command": "run_tests.sh", "hostclass": "mhcinttest"
///   },
///   "mhcfoo": { "deployment_strategy": "blue_green", "elb": "yes" }
/// }
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct DeployConfig {
    sections: BTreeMap<String, Section>,
}

impl DeployConfig {
    pub fn from_file(config_file: &PathBuf) -> DeployResult<Self> {
        let path = Path::new(&config_file);
        let file = File::open(path).map_err(|_err| DeployError::Config {
            dbg: format!("Config file not found: {:?}", path),
        })?;
        serde_json::from_reader(file).map_err(|err| DeployError::Config {
            dbg: format!("Config file {:?} is malformed: {}", path, err),
        })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|options| options.get(key))
            .map(String::as_str)
    }

    /// Resolve a per-hostclass option, falling back through the `test`
    /// section (with and without the `test_` prefix) and finally to
    /// `default_<key>` in the main section.
    pub fn hostclass_option(&self, hostclass: &str, key: &str) -> Option<&str> {
        let test = STATE.test_config_section;
        let alt_key = key.strip_prefix("test_").unwrap_or(key);

        self.get(hostclass, key)
            .or_else(|| self.get(test, key))
            .or_else(|| {
                if alt_key != key {
                    self.get(test, alt_key)
                } else {
                    None
                }
            })
            .or_else(|| {
                self.get(
                    STATE.default_config_section,
                    &format!("default_{}", key),
                )
            })
    }

    pub fn hostclass_option_required(&self, hostclass: &str, key: &str) -> DeployResult<&str> {
        self.hostclass_option(hostclass, key)
            .ok_or(DeployError::Config {
                dbg: format!("No option '{}' configured for hostclass {}", key, hostclass),
            })
    }

    pub fn test_user(&self, hostclass: &str) -> Option<&str> {
        self.hostclass_option(hostclass, "test_user")
    }

    pub fn test_command(&self, hostclass: &str) -> DeployResult<&str> {
        self.hostclass_option_required(hostclass, "test_command")
    }

    pub fn test_hostclass(&self, hostclass: &str) -> DeployResult<&str> {
        self.hostclass_option_required(hostclass, "test_hostclass")
    }

    pub fn deployment_strategy(&self, hostclass: &str) -> Option<&str> {
        self.get(hostclass, "deployment_strategy")
    }

    pub fn uses_elb(&self, hostclass: &str) -> bool {
        self.get(hostclass, "elb").map_or(false, is_truthy)
    }

    pub fn instance_type(&self, hostclass: &str) -> &str {
        self.get(hostclass, "instance_type")
            .unwrap_or(STATE.default_instance_type)
    }

    /// Whitespace separated list option of a hostclass, e.g. `subnets`.
    pub fn hostclass_list(&self, hostclass: &str, key: &str) -> Vec<String> {
        self.hostclass_option(hostclass, key)
            .map(|values| values.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn ami_stages(&self) -> Vec<String> {
        match self.get(STATE.bake_config_section, "ami_stages") {
            Some(stages) => stages.split_whitespace().map(String::from).collect(),
            None => STATE
                .default_ami_stages
                .iter()
                .map(|stage| stage.to_string())
                .collect(),
        }
    }

    pub fn prod_baker(&self) -> Option<&str> {
        self.get(STATE.bake_config_section, "prod_baker")
            .filter(|baker| !baker.is_empty())
    }

    pub fn prod_account_ids(&self) -> Vec<String> {
        self.get(STATE.bake_config_section, "prod_account_ids")
            .map(|ids| ids.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn default_environment(&self) -> Option<&str> {
        self.get(STATE.default_config_section, "default_environment")
    }

    pub fn region(&self) -> &str {
        self.get(STATE.default_config_section, "region")
            .unwrap_or(STATE.region)
    }

    /// Environment to run integration tests from, when it differs from the
    /// environment being deployed.
    pub fn test_environment(&self) -> Option<&str> {
        self.get(STATE.test_config_section, "env")
    }
}

#[cfg(test)]
impl DeployConfig {
    pub fn from_sections(sections: &[(&str, &[(&str, &str)])]) -> Self {
        let sections = sections
            .iter()
            .map(|(name, options)| {
                let options = options
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect();
                (name.to_string(), options)
            })
            .collect();
        DeployConfig { sections }
    }
}
