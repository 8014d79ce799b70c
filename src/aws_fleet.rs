// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::DeployConfig,
    ec2_utils::{describe_instances, filter, terminate_instances},
    error::{DeployError, DeployResult},
    fleet::{
        DeploymentAttempt, Fleet, GroupManager, GroupRequest, Instance, LoadBalancerManager,
        RemoteOutput, SpinupOptions,
    },
    outcome::Outcome,
    ssm_utils,
    state::STATE,
};
use async_trait::async_trait;
use core::time::Duration;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub smoketest: Duration,
    pub autoscale: Duration,
    pub ssm: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            smoketest: STATE.smoketest_timeout,
            autoscale: STATE.autoscale_timeout,
            ssm: STATE.ssm_timeout,
        }
    }
}

/// Instances of one environment, launched through autoscaling groups and
/// reached over SSM.
pub struct AwsFleet {
    ec2_client: aws_sdk_ec2::Client,
    ssm_client: aws_sdk_ssm::Client,
    environment: String,
    config: DeployConfig,
    groups: Arc<dyn GroupManager>,
    elb: Arc<dyn LoadBalancerManager>,
    timeouts: Timeouts,
}

/// Attempts grouped by sequence number. Unsequenced attempts go last.
fn sequence_batches(attempts: &[DeploymentAttempt]) -> Vec<Vec<&DeploymentAttempt>> {
    let mut batches: BTreeMap<u32, Vec<&DeploymentAttempt>> = BTreeMap::new();
    for attempt in attempts {
        batches
            .entry(attempt.sequence.unwrap_or(u32::MAX))
            .or_default()
            .push(attempt);
    }
    batches.into_values().collect()
}

fn is_live(instance: &Instance) -> bool {
    instance.state == "pending" || instance.state == "running"
}

impl AwsFleet {
    pub fn new(
        ec2_client: aws_sdk_ec2::Client,
        ssm_client: aws_sdk_ssm::Client,
        environment: &str,
        config: DeployConfig,
        groups: Arc<dyn GroupManager>,
        elb: Arc<dyn LoadBalancerManager>,
        timeouts: Timeouts,
    ) -> Self {
        AwsFleet {
            ec2_client,
            ssm_client,
            environment: environment.to_string(),
            config,
            groups,
            elb,
            timeouts,
        }
    }

    async fn provision(
        &self,
        attempt: &DeploymentAttempt,
        options: &SpinupOptions,
    ) -> DeployResult<()> {
        let hostclass = &attempt.hostclass;
        let load_balancers = if self.config.uses_elb(hostclass) {
            vec![self.elb.get_or_create(hostclass, options.testing).await?]
        } else {
            Vec::new()
        };
        let instance_type = attempt
            .instance_type
            .clone()
            .unwrap_or_else(|| self.config.instance_type(hostclass).to_string());

        let request = GroupRequest {
            hostclass: hostclass.clone(),
            group_name: options.group_name.clone(),
            create_if_exists: options.create_if_exists,
            image_id: attempt.ami.clone(),
            instance_type,
            capacity: attempt.capacity(),
            load_balancers,
            testing: options.testing,
        };
        let group = self.groups.create_or_update_group(&request).await?;
        debug!("Provisioned {} as {}", hostclass, group.name);
        Ok(())
    }

    async fn smoke_attempt(&self, attempt: &DeploymentAttempt) -> DeployResult<Outcome> {
        let Some(ami) = attempt.ami.as_deref() else {
            let instances = self.instances_from_hostclass(&attempt.hostclass).await?;
            return self.smoketest(&instances).await;
        };
        let scaled = self.wait_for_autoscaling(ami, attempt.desired_size).await?;
        if !scaled.is_passed() {
            return Ok(scaled);
        }
        let instances = self.instances_from_amis(&[ami.to_string()]).await?;
        self.smoketest(&instances).await
    }
}

#[async_trait]
impl Fleet for AwsFleet {
    async fn spinup(
        &self,
        attempts: &[DeploymentAttempt],
        options: &SpinupOptions,
    ) -> DeployResult<()> {
        for batch in sequence_batches(attempts) {
            for attempt in batch.iter() {
                self.provision(attempt, options).await?;
            }
            for attempt in batch.iter().filter(|attempt| attempt.smoke_test) {
                let outcome = self.smoke_attempt(attempt).await?;
                if !outcome.is_passed() {
                    return Err(DeployError::Ec2 {
                        dbg: format!("{} {}", attempt.hostclass, outcome),
                    });
                }
            }
        }
        Ok(())
    }

    async fn remote_exec(
        &self,
        instance: &Instance,
        command: &[String],
        user: Option<&str>,
    ) -> DeployResult<RemoteOutput> {
        ssm_utils::run_command(
            &self.ssm_client,
            &instance.id,
            command,
            user,
            self.timeouts.ssm,
        )
        .await
    }

    async fn wait_for_autoscaling(&self, ami_id: &str, min_count: u32) -> DeployResult<Outcome> {
        let deadline = Instant::now() + self.timeouts.autoscale;
        loop {
            let running = self
                .instances_from_amis(&[ami_id.to_string()])
                .await?
                .into_iter()
                .filter(|instance| instance.state == "running")
                .count();
            debug!("{}/{} instances of {} running", running, min_count, ami_id);
            if running >= min_count as usize {
                return Ok(Outcome::Passed);
            }
            if Instant::now() >= deadline {
                return Ok(Outcome::failed(format!(
                    "only {} of {} instances of {} came up",
                    running, min_count, ami_id
                )));
            }
            sleep(STATE.autoscale_poll_interval).await;
        }
    }

    async fn smoketest(&self, instances: &[Instance]) -> DeployResult<Outcome> {
        let ids: Vec<String> = instances.iter().map(|instance| instance.id.clone()).collect();
        let deadline = Instant::now() + self.timeouts.smoketest;
        loop {
            let current = self.get_instances(&ids).await?;
            if current.len() < ids.len() || current.iter().any(|instance| !is_live(instance)) {
                warn!("Instance terminated during smoke test");
                return Ok(Outcome::failed("instance terminated during smoke test"));
            }
            if current.iter().all(|instance| instance.smoketested) {
                info!("{} instances passed smoke test", current.len());
                return Ok(Outcome::Passed);
            }
            if Instant::now() >= deadline {
                return Ok(Outcome::failed("smoke test timed out"));
            }
            sleep(STATE.smoketest_poll_interval).await;
        }
    }

    async fn smoketest_once(&self, instance: &Instance) -> DeployResult<bool> {
        let current = self.get_instances(&[instance.id.clone()]).await?;
        Ok(current
            .first()
            .map_or(false, |instance| is_live(instance) && instance.smoketested))
    }

    async fn instances(&self) -> DeployResult<Vec<Instance>> {
        describe_instances(&self.ec2_client, &self.environment, Vec::new()).await
    }

    async fn instances_from_amis(&self, ami_ids: &[String]) -> DeployResult<Vec<Instance>> {
        if ami_ids.is_empty() {
            return Ok(Vec::new());
        }
        describe_instances(
            &self.ec2_client,
            &self.environment,
            vec![filter("image-id", ami_ids)],
        )
        .await
    }

    async fn instances_from_hostclass(&self, hostclass: &str) -> DeployResult<Vec<Instance>> {
        describe_instances(
            &self.ec2_client,
            &self.environment,
            vec![filter(
                &format!("tag:{}", STATE.hostclass_tag),
                &[hostclass.to_string()],
            )],
        )
        .await
    }

    async fn get_instances(&self, instance_ids: &[String]) -> DeployResult<Vec<Instance>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        describe_instances(
            &self.ec2_client,
            &self.environment,
            vec![filter("instance-id", instance_ids)],
        )
        .await
    }

    async fn terminate(&self, instances: &[Instance]) -> DeployResult<()> {
        let ids: Vec<String> = instances.iter().map(|instance| instance.id.clone()).collect();
        info!("Terminating {:?}", ids);
        terminate_instances(&self.ec2_client, ids).await
    }
}
