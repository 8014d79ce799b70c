// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Deploy;
use crate::{
    ami::Ami,
    error::DeployResult,
    fleet::Instance,
    outcome::Outcome,
    state::STATE,
};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl Deploy {
    /// Wait for `min_count` instances of the AMI, then for all of them to
    /// pass their smoke test.
    pub async fn wait_for_smoketests(&self, ami_id: &str, min_count: u32) -> DeployResult<Outcome> {
        let scaled = self.fleet.wait_for_autoscaling(ami_id, min_count).await?;
        if !scaled.is_passed() {
            info!(ami = ami_id, "autoscaling timed out");
            return Ok(scaled);
        }

        let instances = self
            .fleet
            .instances_from_amis(&[ami_id.to_string()])
            .await?;
        let smoked = self.fleet.smoketest(&instances).await?;
        if !smoked.is_passed() {
            info!(ami = ami_id, "smoke test {}", smoked);
        }
        Ok(smoked)
    }

    pub(super) async fn group_members(&self, group_name: &str) -> DeployResult<Vec<Instance>> {
        let ids: Vec<String> = self
            .groups
            .list_instances(group_name)
            .await?
            .into_iter()
            .map(|instance| instance.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fleet.get_instances(&ids).await
    }

    async fn hostclass_members(&self, hostclass: &str) -> DeployResult<Vec<Instance>> {
        match self.groups.get_group(hostclass).await? {
            Some(group) => self.group_members(&group.name).await,
            None => Ok(Vec::new()),
        }
    }

    /// Members of the AMI's hostclass group running some other image.
    pub async fn old_instances(&self, ami: &Ami) -> DeployResult<Vec<Instance>> {
        let members = self.hostclass_members(ami.hostclass()).await?;
        Ok(members
            .into_iter()
            .filter(|instance| instance.image_id != ami.id)
            .collect())
    }

    /// Members of the AMI's hostclass group running the AMI.
    pub async fn new_instances(&self, ami: &Ami) -> DeployResult<Vec<Instance>> {
        let members = self.hostclass_members(ami.hostclass()).await?;
        Ok(members
            .into_iter()
            .filter(|instance| instance.image_id == ami.id)
            .collect())
    }

    /// Newest image, other than `ami`, still deployed in the hostclass group
    /// and still registered.
    pub async fn latest_other_image_id(&self, ami: &Ami) -> DeployResult<Option<String>> {
        let deployed: BTreeSet<String> = self
            .old_instances(ami)
            .await?
            .into_iter()
            .map(|instance| instance.image_id)
            .collect();
        if deployed.is_empty() {
            return Ok(None);
        }

        let deployed: Vec<String> = deployed.into_iter().collect();
        let images = self.registry.get_amis(&deployed).await?;
        if images.len() < deployed.len() {
            warn!(
                "{} deployed images no longer exist",
                deployed.len() - images.len()
            );
        }
        Ok(images
            .into_iter()
            .max_by_key(|image| self.creation_time(image))
            .map(|image| image.id))
    }

    /// Toggle maintenance mode on each instance in turn. Instances that fail
    /// to switch are terminated and the attempt is aborted.
    pub async fn set_maintenance_mode(
        &self,
        hostclass: &str,
        instances: &[Instance],
        mode_on: bool,
    ) -> DeployResult<Outcome> {
        let mode = if mode_on { "on" } else { "off" };
        let command: Vec<String> = vec![
            "sudo".to_string(),
            STATE.maintenance_mode_script.to_string(),
            mode.to_string(),
        ];
        let user = self.config.test_user(hostclass);

        let mut bad_instances = Vec::new();
        for instance in instances {
            let output = self.fleet.remote_exec(instance, &command, user).await?;
            debug!(instance = %instance.id, "{}", output.output);
            if !output.is_success() {
                warn!(
                    instance = %instance.id,
                    exit_code = output.exit_code,
                    "maintenance mode {} failed",
                    mode
                );
                bad_instances.push(instance.clone());
            }
        }

        if bad_instances.is_empty() {
            return Ok(Outcome::Passed);
        }
        self.fleet.terminate(&bad_instances).await?;
        Ok(Outcome::aborted(format!(
            "Failed to {} maintenance mode",
            if mode_on { "enter" } else { "exit" }
        )))
    }

    /// Put the instances of the hostclass still running older images into
    /// maintenance mode and run the integration test. On a non-passing test
    /// the old instances are brought back out of maintenance mode.
    pub async fn run_tests_with_maintenance_mode(&self, ami: &Ami) -> DeployResult<Outcome> {
        let hostclass = ami.hostclass();
        let old = self.old_instances(ami).await?;
        let entered = self.set_maintenance_mode(hostclass, &old, true).await?;
        if !entered.is_passed() {
            return Ok(entered);
        }

        let tested = self.run_integration_tests(ami, false).await?;
        if !tested.is_passed() {
            let old = self.old_instances(ami).await?;
            let exited = self.set_maintenance_mode(hostclass, &old, false).await?;
            if !exited.is_passed() {
                warn!(hostclass, "{}", exited);
            }
        }
        Ok(tested)
    }

    /// First instance of the test hostclass that passes a single smoke test.
    pub async fn get_host(&self, test_hostclass: &str) -> DeployResult<Option<Instance>> {
        let candidates = self
            .test_fleet
            .instances_from_hostclass(test_hostclass)
            .await?;
        for instance in candidates {
            if self.test_fleet.smoketest_once(&instance).await? {
                return Ok(Some(instance));
            }
            debug!(instance = %instance.id, "not usable as a test host");
        }
        Ok(None)
    }

    /// Run the hostclass' integration test from a test host. With
    /// `wait_for_elb`, hostclasses behind a load balancer first wait for
    /// the testing load balancer to see healthy instances.
    pub async fn run_integration_tests(
        &self,
        ami: &Ami,
        wait_for_elb: bool,
    ) -> DeployResult<Outcome> {
        let hostclass = ami.hostclass();
        if wait_for_elb && self.config.uses_elb(hostclass) {
            let healthy = self.elb.wait_for_health(hostclass, None, true).await?;
            if !healthy.is_passed() {
                warn!(hostclass, "testing load balancer never became healthy");
                return Ok(Outcome::failed(format!(
                    "testing load balancer for {} never became healthy",
                    hostclass
                )));
            }
        }

        let test_hostclass = self.config.test_hostclass(hostclass)?;
        let test_command = self.config.test_command(hostclass)?;
        let test_user = self.config.test_user(hostclass);
        let test_name = self.integration_test(hostclass);
        info!(
            hostclass,
            test_hostclass,
            "running integration test {}",
            test_name.unwrap_or("-")
        );

        let host = match self.get_host(test_hostclass).await? {
            Some(host) => host,
            None => return Ok(Outcome::aborted("Unable to find test host")),
        };

        let mut command: Vec<String> = test_command.split_whitespace().map(String::from).collect();
        command.extend(test_name.map(String::from));
        let output = self
            .test_fleet
            .remote_exec(&host, &command, test_user)
            .await?;
        info!("{}", output.output);

        if output.is_success() {
            Ok(Outcome::Passed)
        } else {
            Ok(Outcome::failed(format!(
                "integration test {} exited with {}",
                test_name.unwrap_or("-"),
                output.exit_code
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::*;
    use super::*;

    #[tokio::test]
    async fn smoketests_wait_for_autoscaling_first() {
        let mut harness = Harness::new();
        harness.fleet.autoscaling = Outcome::failed("timeout");
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let outcome = deploy.wait_for_smoketests("ami-12345678", 2).await.unwrap();
        assert!(!outcome.is_passed());
        assert_eq!(
            calls.calls(),
            vec![Call::WaitForAutoscaling {
                ami: "ami-12345678".to_string(),
                min_count: 2
            }]
        );
    }

    #[tokio::test]
    async fn smoketests_run_on_instances_of_the_ami() {
        let mut harness = Harness::new();
        harness.add_instance(instance("i-a", "ami-12345678", None));
        harness.add_instance(instance("i-b", "ami-12345678", None));
        harness.add_instance(instance("i-c", "ami-other", None));
        harness.fleet.smoke = Outcome::failed("terminated");
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let outcome = deploy.wait_for_smoketests("ami-12345678", 2).await.unwrap();
        assert_eq!(outcome, Outcome::failed("terminated"));
        assert!(calls.calls().contains(&Call::Smoketest {
            instances: vec!["i-a".to_string(), "i-b".to_string()]
        }));
    }

    #[tokio::test]
    async fn maintenance_mode_command() {
        let harness = Harness::new();
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let outcome = deploy
            .set_maintenance_mode("mhcfoo", &[instance("i-1", "ami-1", None)], true)
            .await
            .unwrap();
        assert!(outcome.is_passed());
        assert_eq!(
            calls.remote_execs(),
            vec![Call::RemoteExec {
                instance: "i-1".to_string(),
                command: vec![
                    "sudo".to_string(),
                    "/opt/wgen/bin/maintenance-mode.sh".to_string(),
                    "on".to_string()
                ],
                user: Some("test_user".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn maintenance_mode_failure_terminates() {
        let mut harness = Harness::new();
        harness.fleet.exit_codes.push(("maintenance-mode.sh", 1));
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let outcome = deploy
            .set_maintenance_mode("foo", &[instance("i-1", "ami-1", None)], false)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Aborted { .. }));
        assert!(calls.calls().contains(&Call::Terminate {
            instances: vec!["i-1".to_string()]
        }));
        match &calls.remote_execs()[0] {
            Call::RemoteExec { command, .. } => assert_eq!(command[2], "off"),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn latest_other_image_from_old_instances() {
        let mut harness = Harness::new();
        harness.groups.default_group = Some(group("ci_mhcabc_1", 2, 3, 4));
        for (id, image) in [("i-1", "mhcabc 1"), ("i-2", "mhcabc 3"), ("i-3", "mhcabc 2")] {
            let ami = Ami::new(&format!("ami-{}", id), image, None);
            harness.add_instance(instance(id, &ami.id, Some("ci_mhcabc_1")));
            harness.registry.amis.push(ami);
        }
        // image of i-4 has been deregistered
        harness.add_instance(instance("i-4", "ami-gone", Some("ci_mhcabc_1")));
        let deploy = harness.build();

        let candidate = Ami::new("ami-11112222", "mhcabc 4", None);
        assert_eq!(
            deploy.latest_other_image_id(&candidate).await.unwrap(),
            Some("ami-i-2".to_string())
        );
    }

    #[tokio::test]
    async fn latest_other_image_without_old_instances() {
        let deploy = Harness::new().build();
        let candidate = Ami::new("ami-11112222", "mhcabc 4", None);
        assert_eq!(deploy.latest_other_image_id(&candidate).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_host_picks_smoketested_instance() {
        let mut harness = Harness::new();
        harness
            .test_fleet
            .instances
            .push(test_host("i-unhealthy", "test_hostclass", false));
        harness
            .test_fleet
            .instances
            .push(test_host("i-12345678", "test_hostclass", true));
        let deploy = harness.build();
        let host = deploy.get_host("test_hostclass").await.unwrap().unwrap();
        assert_eq!(host.id, "i-12345678");
    }

    #[tokio::test]
    async fn get_host_none_when_unhealthy() {
        let mut harness = Harness::new();
        harness
            .test_fleet
            .instances
            .push(test_host("i-12345678", "test_hostclass", false));
        let deploy = harness.build();
        assert_eq!(deploy.get_host("test_hostclass").await.unwrap(), None);
    }

    #[tokio::test]
    async fn integration_test_command() {
        let mut harness = Harness::new();
        harness
            .test_fleet
            .instances
            .push(test_host("i-12345678", "test_hostclass", true));
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let ami = Ami::new("ami-1", "mhcintegrated 1 2", None);
        let outcome = deploy.run_integration_tests(&ami, false).await.unwrap();
        assert!(outcome.is_passed());
        assert_eq!(
            calls.remote_execs(),
            vec![Call::RemoteExec {
                instance: "i-12345678".to_string(),
                command: vec!["test_command".to_string(), "foo_service".to_string()],
                user: Some("test_user".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn integration_test_without_host_aborts() {
        let deploy = Harness::new().build();
        let ami = Ami::new("ami-1", "mhcintegrated 1 2", None);
        let outcome = deploy.run_integration_tests(&ami, false).await.unwrap();
        assert_eq!(outcome, Outcome::aborted("Unable to find test host"));
    }

    #[tokio::test]
    async fn integration_test_failure() {
        let mut harness = Harness::new();
        harness
            .test_fleet
            .instances
            .push(test_host("i-12345678", "test_hostclass", true));
        harness.test_fleet.exit_codes.push(("test_command", 2));
        let deploy = harness.build();
        let ami = Ami::new("ami-1", "mhcintegrated 1 2", None);
        let outcome = deploy.run_integration_tests(&ami, false).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
    }

    #[tokio::test]
    async fn integration_test_waits_for_testing_elb() {
        let mut harness = Harness::new();
        harness
            .test_fleet
            .instances
            .push(test_host("i-12345678", "test_hostclass", true));
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let ami = Ami::new("ami-1", "mhcbluegreen 2", None);
        assert!(deploy.run_integration_tests(&ami, true).await.unwrap().is_passed());
        assert!(calls.calls().contains(&Call::WaitForHealth {
            hostclass: "mhcbluegreen".to_string(),
            instance_ids: None,
            testing: true,
        }));
    }

    #[tokio::test]
    async fn integration_test_fails_on_elb_timeout() {
        let mut harness = Harness::new();
        harness.elb.health.push_back(Outcome::failed("timeout"));
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let ami = Ami::new("ami-1", "mhcbluegreen 2", None);
        let outcome = deploy.run_integration_tests(&ami, true).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert!(calls.remote_execs().is_empty());
    }

    #[tokio::test]
    async fn maintenance_mode_off_after_failed_test() {
        let mut harness = Harness::new();
        harness.groups.default_group = Some(group("ci_mhcintegrated_1", 1, 2, 2));
        harness.add_instance(instance("i-old", "ami-old", Some("ci_mhcintegrated_1")));
        harness
            .test_fleet
            .instances
            .push(test_host("i-tester", "test_hostclass", true));
        harness.test_fleet.exit_codes.push(("test_command", 1));
        let calls = harness.calls.clone();
        let deploy = harness.build();
        let ami = Ami::new("ami-new", "mhcintegrated 2", None);
        let outcome = deploy.run_tests_with_maintenance_mode(&ami).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));

        let modes: Vec<String> = calls
            .remote_execs()
            .into_iter()
            .filter_map(|call| match call {
                Call::RemoteExec { instance, command, .. } if instance == "i-old" => {
                    command.last().cloned()
                }
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec!["on", "off"]);
    }
}
