// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::pipeline::PipelineEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl Capacity {
    pub fn new(min: u32, desired: u32, max: u32) -> Self {
        Capacity { min, desired, max }
    }
}

/// `min(max(value, min), max)`. The upper bound wins when the range is
/// inverted.
pub fn snap_to_range(value: u32, min: u32, max: u32) -> u32 {
    value.max(min).min(max)
}

/// Doubled group used while candidate instances run alongside the old ones.
pub fn transient_capacity(desired: u32) -> Capacity {
    let size = if desired == 0 { 1 } else { desired * 2 };
    Capacity::new(size / 2, size, size)
}

/// Group size to settle on after a classic promotion or rollback. Missing or
/// zero pipeline bounds fall back to the running desired capacity.
pub fn settled_capacity(entry: &PipelineEntry, desired: u32) -> Capacity {
    let max = entry.max_count().filter(|max| *max > 0).unwrap_or(desired);
    let min = entry.min_count().filter(|min| *min > 0).unwrap_or(desired);
    Capacity::new(min, snap_to_range(desired, min, max), max)
}

/// Group size restored once a non-deployable candidate has been smoke
/// tested. Only absent pipeline bounds fall back to `desired`, so an
/// explicit zero keeps the group empty.
pub fn nodeploy_rollback_capacity(entry: &PipelineEntry, desired: u32) -> Capacity {
    let max = entry.max_count().unwrap_or(desired);
    let min = entry.min_count().unwrap_or(desired);
    let wanted = entry.desired_count().unwrap_or(desired);
    Capacity::new(min, snap_to_range(wanted, min, max), max)
}

/// Size of a fresh blue/green group: a copy of the group it replaces, or
/// the pipeline sizes when there is nothing to replace.
pub fn blue_green_capacity(old: Option<Capacity>, entry: &PipelineEntry) -> Capacity {
    if let Some(old) = old {
        return old;
    }
    let desired = entry.desired_count().or(entry.min_count()).unwrap_or(1);
    let min = entry.min_count().unwrap_or(desired);
    let max = entry.max_count().unwrap_or(min.max(desired));
    Capacity::new(min, desired, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Size;

    fn entry(min: Option<&str>, desired: Option<&str>, max: Option<&str>) -> PipelineEntry {
        let size = |raw: Option<&str>| raw.and_then(|raw| Size::parse(raw).unwrap());
        PipelineEntry {
            hostclass: "mhcfoo".to_string(),
            min_size: size(min),
            desired_size: size(desired),
            max_size: size(max),
            ..Default::default()
        }
    }

    #[test]
    fn snaps_into_range() {
        assert_eq!(snap_to_range(0, 1, 3), 1);
        assert_eq!(snap_to_range(5, 1, 3), 3);
        assert_eq!(snap_to_range(2, 1, 3), 2);
        assert_eq!(snap_to_range(2, 3, 1), 1);
    }

    #[test]
    fn transient_doubles_desired() {
        assert_eq!(transient_capacity(0), Capacity::new(0, 1, 1));
        assert_eq!(transient_capacity(1), Capacity::new(1, 2, 2));
        assert_eq!(transient_capacity(2), Capacity::new(2, 4, 4));
    }

    #[test]
    fn settled_falls_back_to_desired() {
        let smokey = entry(Some("2"), Some("2"), None);
        assert_eq!(settled_capacity(&smokey, 2), Capacity::new(2, 2, 2));

        let zeros = entry(Some("0"), None, Some("0"));
        assert_eq!(settled_capacity(&zeros, 3), Capacity::new(3, 3, 3));
    }

    #[test]
    fn settled_uses_schedule_bounds() {
        let timed = entry(
            Some("3@30 16 * * 1-5:4@00 17 * * 1-5"),
            Some("5@30 16 * * 1-5:6@00 17 * * 1-5"),
            Some("5@30 16 * * 1-5:6@00 17 * * 1-5"),
        );
        assert_eq!(settled_capacity(&timed, 2), Capacity::new(3, 3, 6));
    }

    #[test]
    fn nodeploy_rollback_keeps_explicit_zero() {
        let scarey = entry(Some("1"), Some("1"), None);
        assert_eq!(nodeploy_rollback_capacity(&scarey, 1), Capacity::new(1, 1, 1));

        let bare = PipelineEntry::synthesized("mhcfoo");
        assert_eq!(nodeploy_rollback_capacity(&bare, 0), Capacity::new(0, 0, 0));

        let idle = entry(Some("0"), Some("0"), Some("0"));
        assert_eq!(nodeploy_rollback_capacity(&idle, 2), Capacity::new(0, 0, 0));
    }

    #[test]
    fn blue_green_mirrors_old_group() {
        let bluegreen = entry(Some("1"), Some("1"), None);
        assert_eq!(
            blue_green_capacity(Some(Capacity::new(2, 3, 4)), &bluegreen),
            Capacity::new(2, 3, 4)
        );
        assert_eq!(blue_green_capacity(None, &bluegreen), Capacity::new(1, 1, 1));

        let bare = PipelineEntry::synthesized("mhcfoo");
        assert_eq!(blue_green_capacity(None, &bare), Capacity::new(1, 1, 1));

        let sized = entry(Some("2"), None, None);
        assert_eq!(blue_green_capacity(None, &sized), Capacity::new(2, 2, 2));
    }
}
