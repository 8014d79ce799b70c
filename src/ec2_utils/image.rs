// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{filter, tag_value};
use crate::{
    ami::{Ami, Stage},
    config::DeployConfig,
    duration::from_epoch_secs,
    error::{DeployError, DeployResult},
    fleet::AmiRegistry,
    state::STATE,
};
use async_trait::async_trait;
use aws_sdk_ec2::types::{Image, LaunchPermission, LaunchPermissionModifications, Tag};
use std::time::SystemTime;
use tracing::{info, warn};

pub struct AwsAmiRegistry {
    ec2_client: aws_sdk_ec2::Client,
    prod_baker: Option<String>,
    prod_account_ids: Vec<String>,
    stages: Vec<String>,
}

impl AwsAmiRegistry {
    pub fn new(ec2_client: aws_sdk_ec2::Client, config: &DeployConfig) -> Self {
        AwsAmiRegistry {
            ec2_client,
            prod_baker: config.prod_baker().map(String::from),
            prod_account_ids: config.prod_account_ids(),
            stages: config.ami_stages(),
        }
    }

    async fn describe_images(&self, owned: bool, ids: Option<&[String]>) -> DeployResult<Vec<Ami>> {
        let mut request = self.ec2_client.describe_images();
        if owned {
            request = request.owners("self");
        }
        // Filtering by id quietly drops images that were deregistered.
        if let Some(ids) = ids {
            request = request.filters(filter("image-id", ids));
        }
        let result = request.send().await.map_err(|err| DeployError::Ec2 {
            dbg: err.to_string(),
        })?;

        let mut amis = Vec::new();
        for image in result.images().unwrap_or_default() {
            let (Some(id), Some(name)) = (image.image_id(), image.name()) else {
                continue;
            };
            let mut ami = to_ami(id, name, image);
            if ami.created.is_none() {
                ami.created = self.snapshot_time(image).await;
            }
            amis.push(ami);
        }
        Ok(amis)
    }

    /// Start time of the newest snapshot backing the image.
    async fn snapshot_time(&self, image: &Image) -> Option<SystemTime> {
        let snapshot_ids: Vec<String> = image
            .block_device_mappings()
            .unwrap_or_default()
            .iter()
            .filter_map(|mapping| mapping.ebs())
            .filter_map(|ebs| ebs.snapshot_id())
            .map(String::from)
            .collect();
        if snapshot_ids.is_empty() {
            return None;
        }

        let result = self
            .ec2_client
            .describe_snapshots()
            .set_snapshot_ids(Some(snapshot_ids))
            .send()
            .await
            .ok()?;
        result
            .snapshots()
            .unwrap_or_default()
            .iter()
            .filter_map(|snapshot| snapshot.start_time())
            .map(|time| time.secs())
            .max()
            .and_then(|secs| from_epoch_secs(u64::try_from(secs).ok()?))
    }
}

fn to_ami(id: &str, name: &str, image: &Image) -> Ami {
    let tags = image.tags();
    let mut ami = Ami::new(
        id,
        name,
        tag_value(tags, STATE.stage_tag).map(Stage::from_tag),
    );
    ami.state = image
        .state()
        .map(|state| state.as_str().to_string())
        .unwrap_or_default();
    ami.baker = tag_value(tags, STATE.baker_tag).map(String::from);
    ami
}

#[async_trait]
impl AmiRegistry for AwsAmiRegistry {
    async fn list_amis(&self, ids: Option<&[String]>) -> DeployResult<Vec<Ami>> {
        self.describe_images(true, ids).await
    }

    async fn get_amis(&self, ids: &[String]) -> DeployResult<Vec<Ami>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.describe_images(false, Some(ids)).await
    }

    async fn promote_ami(&self, ami: &Ami, stage: &Stage) -> DeployResult<()> {
        if !self.stages.iter().any(|known| known == stage.as_str()) {
            return Err(DeployError::Config {
                dbg: format!(
                    "Unknown ami stage: {}, check config option 'ami_stages'",
                    stage
                ),
            });
        }

        info!("Promoting {} to {}", ami.id, stage);
        self.ec2_client
            .create_tags()
            .resources(&ami.id)
            .tags(Tag::builder().key(STATE.stage_tag).value(stage.as_str()).build())
            .send()
            .await
            .map_err(|err| DeployError::Ec2 {
                dbg: err.to_string(),
            })?;
        Ok(())
    }

    async fn promote_ami_to_production(&self, ami: &Ami) -> DeployResult<()> {
        for account in self.prod_account_ids.iter() {
            warn!("Permitting {} to be launched by prod account {}", ami.id, account);
            self.ec2_client
                .modify_image_attribute()
                .image_id(&ami.id)
                .launch_permission(
                    LaunchPermissionModifications::builder()
                        .add(LaunchPermission::builder().user_id(account).build())
                        .build(),
                )
                .send()
                .await
                .map_err(|err| DeployError::Ec2 {
                    dbg: err.to_string(),
                })?;
        }
        Ok(())
    }

    fn prod_baker(&self) -> Option<String> {
        self.prod_baker.clone()
    }
}
