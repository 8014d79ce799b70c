// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Epoch seconds to a point in time. Zero means "no timestamp".
pub fn from_epoch_secs(secs: u64) -> Option<SystemTime> {
    if secs == 0 {
        None
    } else {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }
}

pub fn display_time(time: Option<SystemTime>) -> String {
    match time {
        Some(time) => humantime::format_rfc3339_seconds(time).to_string(),
        None => "-".to_string(),
    }
}
