// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Deploy;
use crate::{
    ami::Ami,
    capacity::blue_green_capacity,
    error::{DeployError, DeployResult},
    fleet::{DeploymentAttempt, Group, Instance, SpinupOptions},
    outcome::{DeployOutcome, Outcome},
    pipeline::PipelineEntry,
    state::STATE,
};
use tracing::{error, info, warn};

impl Deploy {
    /// Bring the candidate up in a fresh group next to the current one and
    /// swap the groups once it has passed testing.
    pub async fn handle_blue_green_ami(
        &self,
        ami: &Ami,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        let hostclass = ami.hostclass();
        info!(hostclass, ami = %ami.id, "blue/green testing");
        if dry_run {
            return Ok(DeployOutcome::DryRun);
        }

        let entry = self
            .pipeline
            .get(hostclass)
            .cloned()
            .unwrap_or_else(|| PipelineEntry::synthesized(hostclass));
        let old_group = self.groups.get_group(hostclass).await?;
        let capacity = blue_green_capacity(old_group.as_ref().map(Group::capacity), &entry);
        let attempt = DeploymentAttempt::from_entry(&entry, capacity)
            .with_sequence(Some(1))
            .with_ami(Some(&ami.id));

        self.fleet
            .spinup(&[attempt.clone()], &SpinupOptions::new_group())
            .await?;

        let new_group = match self.groups.get_group(hostclass).await? {
            Some(new_group) => new_group,
            None => {
                return Err(DeployError::GroupCollision {
                    dbg: format!("No group found for {} after spinup", hostclass),
                })
            }
        };
        if let Some(old_group) = &old_group {
            if old_group.name == new_group.name {
                return Err(DeployError::GroupCollision {
                    dbg: format!(
                        "New group {} has the same name as the old group",
                        new_group.name
                    ),
                });
            }
        }
        info!(hostclass, group = %new_group.name, "new group is up");

        let mut outcome = self
            .wait_for_smoketests(&ami.id, capacity.desired.max(1))
            .await?;
        if outcome.is_passed() && entry.integration_test.is_some() {
            // The new group has to go on any error from here on.
            outcome = match self.run_integration_tests(ami, true).await {
                Ok(tested) => tested,
                Err(err) => Outcome::aborted(err.to_string()),
            };
        }

        match outcome {
            Outcome::Passed => {
                self.promote_ami(ami, &self.tested_stage()).await;
                if !entry.deployable {
                    info!(hostclass, "not deployable, discarding tested group");
                    self.destroy_new_group(hostclass, &new_group).await?;
                    return Ok(DeployOutcome::Tested);
                }
                self.swap_groups(ami, attempt, old_group, new_group).await
            }
            Outcome::Failed { reason } => {
                warn!(ami = %ami.id, "candidate failed: {}", reason);
                self.promote_ami(ami, "failed").await;
                self.destroy_new_group(hostclass, &new_group).await?;
                Ok(DeployOutcome::Failed)
            }
            Outcome::Aborted { reason } => {
                error!(ami = %ami.id, "Failed to run integration test: {}", reason);
                self.destroy_new_group(hostclass, &new_group).await?;
                Ok(DeployOutcome::Aborted { reason })
            }
        }
    }

    async fn swap_groups(
        &self,
        ami: &Ami,
        attempt: DeploymentAttempt,
        old_group: Option<Group>,
        new_group: Group,
    ) -> DeployResult<DeployOutcome> {
        let hostclass = ami.hostclass();
        let members = self.group_members(&new_group.name).await?;
        if !self.exit_testing_mode(hostclass, &members).await {
            self.destroy_new_group(hostclass, &new_group).await?;
            return Ok(DeployOutcome::NotPromoted {
                reason: "Failed to exit testing mode".to_string(),
            });
        }

        self.fleet
            .spinup(&[attempt], &SpinupOptions::for_group(&new_group.name))
            .await?;

        if self.config.uses_elb(hostclass) {
            let ids: Vec<String> = members.iter().map(|instance| instance.id.clone()).collect();
            let healthy = self.elb.wait_for_health(hostclass, Some(&ids), false).await?;
            if !healthy.is_passed() {
                error!(
                    hostclass,
                    "new group never became healthy in the load balancer: {}", healthy
                );
                self.destroy_new_group(hostclass, &new_group).await?;
                return Ok(DeployOutcome::NotPromoted {
                    reason: format!("load balancer health: {}", healthy),
                });
            }
        }

        if let Some(old_group) = old_group {
            info!(hostclass, group = %old_group.name, "removing old group");
            self.groups.delete_group(&old_group.name, true).await?;
        }
        if self.config.uses_elb(hostclass) {
            self.elb.delete(hostclass, true).await?;
        }
        Ok(DeployOutcome::Deployed)
    }

    /// Returns false if any instance stayed in testing mode.
    async fn exit_testing_mode(&self, hostclass: &str, instances: &[Instance]) -> bool {
        let command = vec![
            "sudo".to_string(),
            STATE.testing_mode_script.to_string(),
            "off".to_string(),
        ];
        let user = self.config.test_user(hostclass);

        let mut all_exited = true;
        for instance in instances {
            match self.fleet.remote_exec(instance, &command, user).await {
                Ok(output) if output.is_success() => {}
                Ok(output) => {
                    warn!(
                        instance = %instance.id,
                        exit_code = output.exit_code,
                        "testing mode still on"
                    );
                    all_exited = false;
                }
                Err(err) => {
                    warn!(instance = %instance.id, "testing mode unknown: {}", err);
                    all_exited = false;
                }
            }
        }
        all_exited
    }

    async fn destroy_new_group(&self, hostclass: &str, new_group: &Group) -> DeployResult<()> {
        self.groups.delete_group(&new_group.name, true).await?;
        if self.config.uses_elb(hostclass) {
            self.elb.delete(hostclass, true).await?;
        }
        Ok(())
    }
}
