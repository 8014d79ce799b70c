// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::duration::from_epoch_secs;
use std::time::SystemTime;

/// Promotion stage of an AMI, read from its `stage` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Untested,
    Tested,
    Failed,
    // A stage configured in `ami_stages` that the deploy flow doesn't act on.
    Other(String),
}

impl Stage {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "untested" => Stage::Untested,
            "tested" => Stage::Tested,
            "failed" => Stage::Failed,
            other => Stage::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Stage::Untested => "untested",
            Stage::Tested => "tested",
            Stage::Failed => "failed",
            Stage::Other(other) => other,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ami {
    pub id: String,
    /// `"<hostclass> [...] <epoch seconds>"`
    pub name: String,
    pub stage: Option<Stage>,
    pub state: String,
    pub baker: Option<String>,
    // Resolved by the registry when the image is listed.
    pub created: Option<SystemTime>,
}

impl Ami {
    pub fn new(id: &str, name: &str, stage: Option<Stage>) -> Self {
        let ami = Ami {
            id: id.to_string(),
            name: name.to_string(),
            stage,
            state: "available".to_string(),
            baker: None,
            created: None,
        };
        Ami {
            created: ami.time_from_name(),
            ..ami
        }
    }

    pub fn hostclass(&self) -> &str {
        hostclass_from_name(&self.name)
    }

    pub fn is_available(&self) -> bool {
        self.state == "available"
    }

    /// Trailing integer of the name, 0 if there isn't one.
    pub fn timestamp(&self) -> u64 {
        self.name
            .split_whitespace()
            .last()
            .and_then(|token| token.parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn time_from_name(&self) -> Option<SystemTime> {
        from_epoch_secs(self.timestamp())
    }
}

pub fn hostclass_from_name(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or("")
}
