// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{DeployError, DeployResult},
    strategy::DeploymentStrategy,
};
use serde::{Deserialize, Deserializer};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};
use tracing::debug;

const YES_LIST: [&str; 6] = ["true", "yes", "t", "y", "aye", "1"];

pub fn is_truthy(value: &str) -> bool {
    YES_LIST.contains(&value.to_lowercase().as_str())
}

/// Group size from a pipeline file: a plain count or a schedule of
/// `count@cron` parts separated by `:`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Size {
    Fixed(u32),
    Timed(Vec<(u32, String)>),
}

impl Size {
    pub fn parse(raw: &str) -> DeployResult<Option<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if let Ok(count) = raw.parse::<u32>() {
            return Ok(Some(Size::Fixed(count)));
        }

        let mut schedule = Vec::new();
        for part in raw.split(':') {
            let (count, recurrence) = part.split_once('@').ok_or(DeployError::Pipeline {
                dbg: format!("Malformed size: {}", raw),
            })?;
            let count = count.trim().parse::<u32>().map_err(|_err| DeployError::Pipeline {
                dbg: format!("Malformed size: {}", raw),
            })?;
            schedule.push((count, recurrence.to_string()));
        }
        Ok(Some(Size::Timed(schedule)))
    }

    pub fn minimum(&self) -> u32 {
        match self {
            Size::Fixed(count) => *count,
            Size::Timed(schedule) => schedule.iter().map(|(count, _)| *count).min().unwrap_or(0),
        }
    }

    pub fn maximum(&self) -> u32 {
        match self {
            Size::Fixed(count) => *count,
            Size::Timed(schedule) => schedule.iter().map(|(count, _)| *count).max().unwrap_or(0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PipelineEntry {
    pub hostclass: String,
    #[serde(default, deserialize_with = "de_size")]
    pub min_size: Option<Size>,
    #[serde(default, deserialize_with = "de_size")]
    pub desired_size: Option<Size>,
    #[serde(default, deserialize_with = "de_size")]
    pub max_size: Option<Size>,
    #[serde(default, deserialize_with = "de_truthy")]
    pub deployable: bool,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub integration_test: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    pub sequence: Option<u32>,
    #[serde(default, deserialize_with = "de_strategy")]
    pub deployment_strategy: Option<DeploymentStrategy>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub instance_type: Option<String>,
}

impl PipelineEntry {
    /// Entry used for a hostclass the pipeline doesn't mention.
    pub fn synthesized(hostclass: &str) -> Self {
        PipelineEntry {
            hostclass: hostclass.to_string(),
            ..Default::default()
        }
    }

    pub fn min_count(&self) -> Option<u32> {
        self.min_size.as_ref().map(Size::minimum)
    }

    pub fn desired_count(&self) -> Option<u32> {
        self.desired_size.as_ref().map(Size::maximum)
    }

    pub fn max_count(&self) -> Option<u32> {
        self.max_size.as_ref().map(Size::maximum)
    }
}

/// Hostclass keyed view of a pipeline definition.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    entries: BTreeMap<String, PipelineEntry>,
    // false when no pipeline file was given
    defined: bool,
}

impl Pipeline {
    pub fn new(entries: Vec<PipelineEntry>) -> Self {
        let defined = !entries.is_empty();
        let entries = entries
            .into_iter()
            .map(|entry| (entry.hostclass.clone(), entry))
            .collect();
        Pipeline { entries, defined }
    }

    /// Load a pipeline. `.json` files hold an array of entries, anything
    /// else is read as CSV with a header row.
    pub fn from_file(pipeline_file: &PathBuf) -> DeployResult<Self> {
        let path = Path::new(&pipeline_file);
        let file = File::open(path).map_err(|_err| DeployError::Pipeline {
            dbg: format!("Pipeline file not found: {:?}", path),
        })?;
        let is_json = path.extension().map_or(false, |ext| ext == "json");
        let entries = if is_json {
            serde_json::from_reader(file).map_err(|err| DeployError::Pipeline {
                dbg: format!("Pipeline file {:?} is malformed: {}", path, err),
            })?
        } else {
            read_csv(file).map_err(|err| DeployError::Pipeline {
                dbg: format!("Pipeline file {:?}: {}", path, err),
            })?
        };
        debug!("pipeline hostclasses: {}", entries.len());
        Ok(Pipeline::new(entries))
    }

    pub fn get(&self, hostclass: &str) -> Option<&PipelineEntry> {
        self.entries.get(hostclass)
    }

    pub fn contains(&self, hostclass: &str) -> bool {
        self.entries.contains_key(hostclass)
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn hostclasses(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn read_csv<R: Read>(input: R) -> DeployResult<Vec<PipelineEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let headers = reader.headers().map_err(|err| DeployError::Pipeline {
        dbg: err.to_string(),
    })?;
    if !headers.iter().any(|header| header == "hostclass") {
        return Err(DeployError::Pipeline {
            dbg: format!(
                "missing required header hostclass (found: {:?})",
                headers.iter().collect::<Vec<_>>()
            ),
        });
    }
    reader
        .deserialize()
        .collect::<Result<Vec<PipelineEntry>, _>>()
        .map_err(|err| DeployError::Pipeline {
            dbg: err.to_string(),
        })
}

// Pipeline files are often exported from spreadsheets, so scalar fields may
// arrive as strings, numbers, booleans or null.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Num(u64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Num(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn de_scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value: Option<Scalar> = Option::deserialize(deserializer)?;
    Ok(value.map(Scalar::into_string).filter(|s| !s.trim().is_empty()))
}

fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Size>, D::Error> {
    match de_scalar(deserializer)? {
        Some(raw) => Size::parse(&raw).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn de_truthy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(de_scalar(deserializer)?.map_or(false, |raw| is_truthy(&raw)))
}

fn de_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    de_scalar(deserializer)
}

fn de_opt_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    match de_scalar(deserializer)? {
        Some(raw) => raw.trim().parse().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn de_strategy<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DeploymentStrategy>, D::Error> {
    match de_scalar(deserializer)? {
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
