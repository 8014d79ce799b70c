// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::ami::Ami;
use std::{collections::BTreeMap, time::SystemTime};

/// Hostclass to AMI.
pub type AmiMap = BTreeMap<String, Ami>;

/// Which stage tag an AMI must carry to be picked up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageFilter<'a> {
    Tagged(&'a str),
    Untagged,
}

impl StageFilter<'_> {
    fn matches(&self, ami: &Ami) -> bool {
        match (self, &ami.stage) {
            (StageFilter::Tagged(want), Some(stage)) => stage.as_str() == *want,
            (StageFilter::Untagged, None) => true,
            _ => false,
        }
    }
}

/// Newest AMI per hostclass in the given stage. AMIs without a creation
/// time never make the cut, and a later AMI only replaces an earlier pick
/// when it is strictly newer.
pub fn latest_in_stage<F>(amis: &[Ami], filter: StageFilter, time: F) -> AmiMap
where
    F: Fn(&Ami) -> Option<SystemTime>,
{
    let mut latest = AmiMap::new();
    for ami in amis.iter().filter(|ami| filter.matches(ami)) {
        let new_time = match time(ami) {
            Some(new_time) => new_time,
            None => continue,
        };
        let replace = match latest.get(ami.hostclass()) {
            Some(old) => time(old).map_or(false, |old_time| new_time > old_time),
            None => true,
        };
        if replace {
            latest.insert(ami.hostclass().to_string(), ami.clone());
        }
    }
    latest
}

/// AMIs of `second` that are newer than `first`'s AMI for the same
/// hostclass, or whose hostclass `first` doesn't have.
pub fn newer_in_second<F>(first: &AmiMap, second: &AmiMap, time: F) -> Vec<Ami>
where
    F: Fn(&Ami) -> Option<SystemTime>,
{
    second
        .iter()
        .filter(|(hostclass, ami)| match first.get(*hostclass) {
            Some(current) => time(ami) > time(current),
            None => true,
        })
        .map(|(_, ami)| ami.clone())
        .collect()
}

/// Per hostclass, the newer AMI of the two maps. Ties keep `first`.
pub fn newest_in_either<F>(first: AmiMap, second: AmiMap, time: F) -> AmiMap
where
    F: Fn(&Ami) -> Option<SystemTime>,
{
    let mut newest = first;
    for (hostclass, ami) in second {
        let replace = match newest.get(&hostclass) {
            Some(current) => time(&ami) > time(current),
            None => true,
        };
        if replace {
            newest.insert(hostclass, ami);
        }
    }
    newest
}

/// Newest AMI per hostclass among `amis`. Later AMIs win ties.
pub fn newest_per_hostclass<F>(mut amis: Vec<Ami>, time: F) -> AmiMap
where
    F: Fn(&Ami) -> Option<SystemTime>,
{
    amis.sort_by_key(|ami| time(ami));
    amis.into_iter()
        .map(|ami| (ami.hostclass().to_string(), ami))
        .collect()
}
