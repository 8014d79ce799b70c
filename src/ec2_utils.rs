// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use aws_sdk_ec2::types::Tag;

mod image;
mod instance;

pub use image::AwsAmiRegistry;
pub use instance::{describe_instances, filter, terminate_instances};

fn tag_value<'a>(tags: Option<&'a [Tag]>, key: &str) -> Option<&'a str> {
    tags.unwrap_or_default()
        .iter()
        .find(|tag| tag.key() == Some(key))
        .and_then(|tag| tag.value())
}
