// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::error::DeployError;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DeploymentStrategy {
    // Double the capacity of the existing group with the new AMI, then
    // scale the old instances away.
    #[default]
    #[value(name = "classic")]
    Classic,

    // Stand up a separate group with the new AMI and swap it in for the
    // old group once it passes testing.
    #[value(name = "blue_green")]
    BlueGreen,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::Classic => "classic",
            DeploymentStrategy::BlueGreen => "blue_green",
        }
    }

    /// Caller choice first, then the pipeline entry, then the hostclass
    /// config option, then classic.
    pub fn resolve(
        explicit: Option<DeploymentStrategy>,
        pipeline: Option<DeploymentStrategy>,
        configured: Option<&str>,
    ) -> Result<Self, DeployError> {
        if let Some(strategy) = explicit.or(pipeline) {
            return Ok(strategy);
        }
        match configured {
            Some(raw) => raw.parse(),
            None => Ok(DeploymentStrategy::Classic),
        }
    }
}

impl FromStr for DeploymentStrategy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "classic" => Ok(DeploymentStrategy::Classic),
            "blue_green" => Ok(DeploymentStrategy::BlueGreen),
            other => Err(DeployError::UnknownStrategy {
                dbg: format!(
                    "Unsupported deployment strategy: {}. Expected 'classic' or 'blue_green'",
                    other
                ),
            }),
        }
    }
}

impl std::fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
