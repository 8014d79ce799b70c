// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::DeployConfig,
    ec2_utils::{describe_instances, filter},
    error::{DeployError, DeployResult},
    fleet::{Group, GroupManager, GroupRequest, Instance},
    pipeline::is_truthy,
    state::STATE,
};
use async_trait::async_trait;
use aws_sdk_autoscaling::types::{AutoScalingGroup, Filter, Tag};
use base64::{engine::general_purpose, Engine as _};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub struct AwsGroupManager {
    client: aws_sdk_autoscaling::Client,
    ec2_client: aws_sdk_ec2::Client,
    environment: String,
    config: DeployConfig,
}

// Sizes are optional in some SDK shapes and plain in others.
fn size(value: impl Into<Option<i32>>) -> u32 {
    value
        .into()
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_group(group: &AutoScalingGroup) -> Option<Group> {
    Some(Group {
        name: group.auto_scaling_group_name()?.to_string(),
        min_size: size(group.min_size()),
        max_size: size(group.max_size()),
        desired_capacity: size(group.desired_capacity()),
        load_balancers: group.load_balancer_names().unwrap_or_default().to_vec(),
    })
}

fn created_secs(group: &AutoScalingGroup) -> i64 {
    group.created_time().map_or(0, |time| time.secs())
}

/// Launch user data in `key="value"` lines.
pub fn render_user_data(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"\n", key, value))
        .collect()
}

impl AwsGroupManager {
    pub fn new(
        client: aws_sdk_autoscaling::Client,
        ec2_client: aws_sdk_ec2::Client,
        environment: &str,
        config: DeployConfig,
    ) -> Self {
        AwsGroupManager {
            client,
            ec2_client,
            environment: environment.to_string(),
            config,
        }
    }

    fn group_name(&self, hostclass: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        format!("{}_{}_{}", self.environment, hostclass, millis)
    }

    /// Groups of the hostclass in this environment, oldest first.
    async fn hostclass_groups(&self, hostclass: &str) -> DeployResult<Vec<AutoScalingGroup>> {
        let filters = vec![
            Filter::builder()
                .name(format!("tag:{}", STATE.hostclass_tag))
                .values(hostclass)
                .build(),
            Filter::builder()
                .name(format!("tag:{}", STATE.environment_tag))
                .values(&self.environment)
                .build(),
        ];

        let mut groups = Vec::new();
        let mut next_token = None;
        loop {
            let result = self
                .client
                .describe_auto_scaling_groups()
                .set_filters(Some(filters.clone()))
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|err| DeployError::Autoscale {
                    dbg: err.to_string(),
                })?;
            groups.extend(result.auto_scaling_groups().unwrap_or_default().iter().cloned());

            next_token = result.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }
        groups.sort_by_key(created_secs);
        Ok(groups)
    }

    async fn describe_group(&self, name: &str) -> DeployResult<Option<AutoScalingGroup>> {
        let result = self
            .client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(name)
            .send()
            .await
            .map_err(|err| DeployError::Autoscale {
                dbg: err.to_string(),
            })?;
        Ok(result
            .auto_scaling_groups()
            .unwrap_or_default()
            .first()
            .cloned())
    }

    async fn create_launch_config(
        &self,
        request: &GroupRequest,
        image_id: &str,
    ) -> DeployResult<String> {
        let name = format!(
            "{}_{}_{}",
            self.environment,
            request.hostclass,
            uuid::Uuid::new_v4()
        );
        let user_data = render_user_data(&[
            ("hostclass", request.hostclass.clone()),
            ("environment_name", self.environment.clone()),
            ("is_testing", if request.testing { "1" } else { "0" }.to_string()),
            (
                "smoketest_termination",
                self.config
                    .hostclass_option(&request.hostclass, "smoketest_termination")
                    .map_or("0", |value| if is_truthy(value) { "1" } else { "0" })
                    .to_string(),
            ),
        ]);

        debug!("Creating launch configuration {} for {}", name, image_id);
        self.client
            .create_launch_configuration()
            .launch_configuration_name(&name)
            .image_id(image_id)
            .instance_type(&request.instance_type)
            .user_data(general_purpose::STANDARD.encode(user_data))
            .set_security_groups(Some(
                self.config
                    .hostclass_list(&request.hostclass, "security_groups"),
            ))
            .send()
            .await
            .map_err(|err| DeployError::Autoscale {
                dbg: err.to_string(),
            })?;
        Ok(name)
    }

    async fn delete_launch_config(&self, name: &str) {
        let result = self
            .client
            .delete_launch_configuration()
            .launch_configuration_name(name)
            .send()
            .await;
        if let Err(err) = result {
            warn!("Unable to delete launch configuration {}: {}", name, err);
        }
    }

    async fn update_group(
        &self,
        existing: &AutoScalingGroup,
        request: &GroupRequest,
    ) -> DeployResult<String> {
        let name = existing
            .auto_scaling_group_name()
            .unwrap_or_default()
            .to_string();
        let old_config = existing.launch_configuration_name().map(String::from);
        let new_config = match &request.image_id {
            Some(image_id) => Some(self.create_launch_config(request, image_id).await?),
            None => None,
        };

        info!(
            "Updating group {} to {}/{}/{}",
            name, request.capacity.min, request.capacity.desired, request.capacity.max
        );
        self.client
            .update_auto_scaling_group()
            .auto_scaling_group_name(&name)
            .set_launch_configuration_name(new_config.clone())
            .min_size(to_i32(request.capacity.min))
            .max_size(to_i32(request.capacity.max))
            .desired_capacity(to_i32(request.capacity.desired))
            .send()
            .await
            .map_err(|err| DeployError::Autoscale {
                dbg: err.to_string(),
            })?;

        let attached = existing.load_balancer_names().unwrap_or_default();
        let missing: Vec<String> = request
            .load_balancers
            .iter()
            .filter(|elb| !attached.contains(elb))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.client
                .attach_load_balancers()
                .auto_scaling_group_name(&name)
                .set_load_balancer_names(Some(missing))
                .send()
                .await
                .map_err(|err| DeployError::Autoscale {
                    dbg: err.to_string(),
                })?;
        }

        if let (Some(old_config), Some(_)) = (old_config, new_config) {
            self.delete_launch_config(&old_config).await;
        }
        Ok(name)
    }

    async fn create_group(&self, request: &GroupRequest) -> DeployResult<String> {
        let image_id = request.image_id.as_deref().ok_or(DeployError::Autoscale {
            dbg: format!("No image to launch a new {} group from", request.hostclass),
        })?;
        let launch_config = self.create_launch_config(request, image_id).await?;
        let name = self.group_name(&request.hostclass);

        let mut tags = vec![
            (STATE.hostclass_tag, request.hostclass.clone()),
            (STATE.environment_tag, self.environment.clone()),
        ];
        if request.testing {
            tags.push((STATE.testing_tag, "true".to_string()));
        }
        let tags = tags
            .into_iter()
            .map(|(key, value)| {
                Tag::builder()
                    .key(key)
                    .value(value)
                    .resource_id(&name)
                    .resource_type("auto-scaling-group")
                    .propagate_at_launch(true)
                    .build()
            })
            .collect();

        info!(
            "Creating group {} at {}/{}/{}",
            name, request.capacity.min, request.capacity.desired, request.capacity.max
        );
        self.client
            .create_auto_scaling_group()
            .auto_scaling_group_name(&name)
            .launch_configuration_name(launch_config)
            .min_size(to_i32(request.capacity.min))
            .max_size(to_i32(request.capacity.max))
            .desired_capacity(to_i32(request.capacity.desired))
            .vpc_zone_identifier(
                self.config
                    .hostclass_list(&request.hostclass, "subnets")
                    .join(","),
            )
            .set_load_balancer_names(Some(request.load_balancers.clone()))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|err| DeployError::Autoscale {
                dbg: err.to_string(),
            })?;
        Ok(name)
    }
}

#[async_trait]
impl GroupManager for AwsGroupManager {
    async fn get_group(&self, hostclass: &str) -> DeployResult<Option<Group>> {
        let groups = self.hostclass_groups(hostclass).await?;
        Ok(groups.last().and_then(to_group))
    }

    async fn get_group_by_name(&self, name: &str) -> DeployResult<Option<Group>> {
        Ok(self.describe_group(name).await?.as_ref().and_then(to_group))
    }

    async fn create_or_update_group(&self, request: &GroupRequest) -> DeployResult<Group> {
        let existing = match &request.group_name {
            Some(name) => self.describe_group(name).await?,
            None if request.create_if_exists => None,
            None => self.hostclass_groups(&request.hostclass).await?.pop(),
        };

        let name = match existing {
            Some(existing) => self.update_group(&existing, request).await?,
            None => self.create_group(request).await?,
        };
        self.get_group_by_name(&name)
            .await?
            .ok_or(DeployError::Autoscale {
                dbg: format!("Group {} vanished after update", name),
            })
    }

    async fn delete_group(&self, name: &str, force: bool) -> DeployResult<()> {
        info!("Deleting group {}", name);
        self.client
            .delete_auto_scaling_group()
            .auto_scaling_group_name(name)
            .force_delete(force)
            .send()
            .await
            .map_err(|err| DeployError::Autoscale {
                dbg: err.to_string(),
            })?;
        Ok(())
    }

    async fn delete_hostclass_groups(&self, hostclass: &str, force: bool) -> DeployResult<()> {
        for group in self.hostclass_groups(hostclass).await? {
            if let Some(name) = group.auto_scaling_group_name() {
                self.delete_group(name, force).await?;
            }
        }
        Ok(())
    }

    async fn list_instances(&self, group_name: &str) -> DeployResult<Vec<Instance>> {
        describe_instances(
            &self.ec2_client,
            &self.environment,
            vec![filter(
                &format!("tag:{}", STATE.group_name_tag),
                &[group_name.to_string()],
            )],
        )
        .await
    }

    async fn terminate_via_autoscaler(&self, instance_ids: &[String]) -> DeployResult<()> {
        for instance_id in instance_ids {
            debug!("Terminating {} through its group", instance_id);
            self.client
                .terminate_instance_in_auto_scaling_group()
                .instance_id(instance_id)
                .should_decrement_desired_capacity(true)
                .send()
                .await
                .map_err(|err| DeployError::Autoscale {
                    dbg: err.to_string(),
                })?;
        }
        Ok(())
    }
}
