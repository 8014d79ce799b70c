// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Deploy;
use crate::{
    ami::Ami,
    capacity::{nodeploy_rollback_capacity, settled_capacity, transient_capacity},
    error::{DeployError, DeployResult},
    fleet::{DeploymentAttempt, Instance, SpinupOptions},
    outcome::{DeployOutcome, Outcome},
    pipeline::PipelineEntry,
};
use tracing::{error, info, warn};

impl Deploy {
    /// Candidate instances run next to the old ones in the hostclass group.
    fn transient_attempt(entry: &PipelineEntry, ami: &Ami, desired: u32) -> DeploymentAttempt {
        DeploymentAttempt::from_entry(entry, transient_capacity(desired))
            .with_sequence(Some(1))
            .with_ami(Some(&ami.id))
    }

    async fn terminate_via_autoscaler(&self, instances: &[Instance]) -> DeployResult<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = instances.iter().map(|instance| instance.id.clone()).collect();
        self.groups.terminate_via_autoscaler(&ids).await
    }

    /// Test a deployable hostclass in place: double the group with the
    /// candidate, keep it on success, roll back to the previous image
    /// otherwise.
    pub async fn handle_tested_ami(
        &self,
        entry: &PipelineEntry,
        ami: &Ami,
        desired: u32,
        run_tests: bool,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        info!(hostclass = %entry.hostclass, ami = %ami.id, "testing deployable hostclass");
        if dry_run {
            return Ok(DeployOutcome::DryRun);
        }

        if desired > 0 && run_tests {
            let pre_test = self.run_integration_tests(ami, false).await?;
            if !pre_test.is_passed() {
                return Err(DeployError::PreTest {
                    dbg: format!("Failed pre-test -- not testing AMI {}: {}", ami.id, pre_test),
                });
            }
        }

        let attempt = Self::transient_attempt(entry, ami, desired);
        self.fleet
            .spinup(&[attempt.clone()], &SpinupOptions::default())
            .await?;

        let mut outcome = self.wait_for_smoketests(&ami.id, desired.max(1)).await?;
        if outcome.is_passed() && run_tests {
            // Errors past the spinup still roll back.
            outcome = match self.run_tests_with_maintenance_mode(ami).await {
                Ok(tested) => tested,
                Err(err) => Outcome::aborted(err.to_string()),
            };
        }

        let settled = settled_capacity(entry, desired);
        match outcome {
            Outcome::Passed => {
                let post = DeploymentAttempt {
                    min_size: settled.min,
                    desired_size: settled.desired,
                    max_size: settled.max,
                    ..attempt
                };
                let old = self.old_instances(ami).await?;
                self.terminate_via_autoscaler(&old).await?;
                self.fleet.spinup(&[post], &SpinupOptions::default()).await?;
                self.promote_ami(ami, &self.tested_stage()).await;
                return Ok(DeployOutcome::Deployed);
            }
            Outcome::Failed { ref reason } => {
                warn!(ami = %ami.id, "candidate failed: {}", reason);
                self.promote_ami(ami, "failed").await;
            }
            Outcome::Aborted { ref reason } => {
                error!(ami = %ami.id, "Failed to run integration test: {}", reason);
            }
        }

        let rollback_ami = self.latest_other_image_id(ami).await?;
        if rollback_ami.is_none() {
            error!(
                hostclass = %entry.hostclass,
                "Unable to rollback to old AMI. Autoscaling group will use new AMI on next event!"
            );
        }
        let rollback =
            DeploymentAttempt::from_entry(entry, settled).with_ami(rollback_ami.as_deref());

        let new = self.new_instances(ami).await?;
        self.terminate_via_autoscaler(&new).await?;
        self.fleet
            .spinup(&[rollback], &SpinupOptions::default())
            .await?;

        Ok(match outcome {
            Outcome::Aborted { reason } => DeployOutcome::Aborted { reason },
            _ => DeployOutcome::Failed,
        })
    }

    /// Smoke test a hostclass that can't be deployed while serving. The
    /// running instances are left alone and only the group's launch image
    /// is moved to the candidate when it passes.
    pub async fn handle_nodeploy_ami(
        &self,
        entry: Option<&PipelineEntry>,
        ami: &Ami,
        desired: u32,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        let entry = entry
            .cloned()
            .unwrap_or_else(|| PipelineEntry::synthesized(ami.hostclass()));
        info!(hostclass = %entry.hostclass, ami = %ami.id, "smoke testing non-deploy hostclass");
        if dry_run {
            return Ok(DeployOutcome::DryRun);
        }

        let attempt = Self::transient_attempt(&entry, ami, desired);
        let rollback_capacity = nodeploy_rollback_capacity(&entry, desired);
        let rollback =
            DeploymentAttempt::from_entry(&entry, rollback_capacity).with_sequence(Some(1));

        self.fleet
            .spinup(&[attempt], &SpinupOptions::testing())
            .await?;

        let smoked = self.wait_for_smoketests(&ami.id, desired.max(1)).await?;
        let (rollback, outcome) = if smoked.is_passed() {
            self.promote_ami(ami, &self.tested_stage()).await;
            (rollback.with_ami(Some(&ami.id)), DeployOutcome::Tested)
        } else {
            warn!(ami = %ami.id, "candidate failed: {}", smoked);
            self.promote_ami(ami, "failed").await;
            (rollback.with_ami(None), DeployOutcome::Failed)
        };

        if rollback.desired_size > 0 {
            let new = self.new_instances(ami).await?;
            self.terminate_via_autoscaler(&new).await?;
            self.fleet
                .spinup(&[rollback], &SpinupOptions::default())
                .await?;
        } else {
            self.groups
                .delete_hostclass_groups(&entry.hostclass, true)
                .await?;
        }
        Ok(outcome)
    }
}
