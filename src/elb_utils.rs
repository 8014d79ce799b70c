// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::DeployConfig,
    error::{DeployError, DeployResult},
    fleet::LoadBalancerManager,
    outcome::Outcome,
    state::STATE,
};
use async_trait::async_trait;
use aws_sdk_elasticloadbalancing::types::{HealthCheck, Instance, Listener, Tag};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const IN_SERVICE: &str = "InService";

pub struct AwsLoadBalancerManager {
    client: aws_sdk_elasticloadbalancing::Client,
    environment: String,
    config: DeployConfig,
}

impl AwsLoadBalancerManager {
    pub fn new(
        client: aws_sdk_elasticloadbalancing::Client,
        environment: &str,
        config: DeployConfig,
    ) -> Self {
        AwsLoadBalancerManager {
            client,
            environment: environment.to_string(),
            config,
        }
    }

    async fn exists(&self, name: &str) -> DeployResult<bool> {
        let mut marker = None;
        loop {
            let result = self
                .client
                .describe_load_balancers()
                .set_marker(marker)
                .send()
                .await
                .map_err(|err| DeployError::Elb {
                    dbg: err.to_string(),
                })?;
            let found = result
                .load_balancer_descriptions()
                .unwrap_or_default()
                .iter()
                .any(|elb| elb.load_balancer_name() == Some(name));
            if found {
                return Ok(true);
            }

            marker = result.next_marker().map(String::from);
            if marker.is_none() {
                return Ok(false);
            }
        }
    }

    async fn create(&self, name: &str, hostclass: &str, testing: bool) -> DeployResult<()> {
        info!("Creating load balancer {}", name);
        let mut tags = vec![
            Tag::builder()
                .key(STATE.hostclass_tag)
                .value(hostclass)
                .build(),
            Tag::builder()
                .key(STATE.environment_tag)
                .value(&self.environment)
                .build(),
        ];
        if testing {
            tags.push(Tag::builder().key(STATE.testing_tag).value("true").build());
        }

        let subnets = match self.config.hostclass_list(hostclass, "elb_subnets") {
            subnets if subnets.is_empty() => self.config.hostclass_list(hostclass, "subnets"),
            subnets => subnets,
        };
        self.client
            .create_load_balancer()
            .load_balancer_name(name)
            .listeners(
                Listener::builder()
                    .protocol("HTTP")
                    .load_balancer_port(STATE.elb_port)
                    .instance_protocol("HTTP")
                    .instance_port(STATE.elb_port)
                    .build(),
            )
            .set_subnets(Some(subnets))
            .set_security_groups(Some(
                self.config.hostclass_list(hostclass, "elb_security_groups"),
            ))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|err| DeployError::Elb {
                dbg: err.to_string(),
            })?;

        let health_check_path = self
            .config
            .hostclass_option(hostclass, "elb_health_check_url")
            .unwrap_or("/");
        self.client
            .configure_health_check()
            .load_balancer_name(name)
            .health_check(
                HealthCheck::builder()
                    .target(format!("HTTP:{}{}", STATE.elb_port, health_check_path))
                    .interval(10)
                    .timeout(5)
                    .healthy_threshold(2)
                    .unhealthy_threshold(2)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| DeployError::Elb {
                dbg: err.to_string(),
            })?;
        Ok(())
    }

    /// True once every requested instance reports in service.
    async fn is_healthy(&self, name: &str, instance_ids: Option<&[String]>) -> DeployResult<bool> {
        let instances = instance_ids.map(|ids| {
            ids.iter()
                .map(|id| Instance::builder().instance_id(id).build())
                .collect::<Vec<_>>()
        });
        let result = self
            .client
            .describe_instance_health()
            .load_balancer_name(name)
            .set_instances(instances)
            .send()
            .await
            .map_err(|err| DeployError::Elb {
                dbg: err.to_string(),
            })?;

        let states = result.instance_states().unwrap_or_default();
        let expected = instance_ids.map_or(1, |ids| ids.len());
        let in_service = states
            .iter()
            .filter(|state| state.state() == Some(IN_SERVICE))
            .count();
        debug!("{}: {}/{} in service", name, in_service, states.len());
        Ok(in_service == states.len() && in_service >= expected)
    }
}

#[async_trait]
impl LoadBalancerManager for AwsLoadBalancerManager {
    async fn get_or_create(&self, hostclass: &str, testing: bool) -> DeployResult<String> {
        let name = STATE.elb_name(&self.environment, hostclass, testing);
        if !self.exists(&name).await? {
            self.create(&name, hostclass, testing).await?;
        }
        Ok(name)
    }

    async fn delete(&self, hostclass: &str, testing: bool) -> DeployResult<()> {
        let name = STATE.elb_name(&self.environment, hostclass, testing);
        if !self.exists(&name).await? {
            return Ok(());
        }
        info!("Deleting load balancer {}", name);
        self.client
            .delete_load_balancer()
            .load_balancer_name(&name)
            .send()
            .await
            .map_err(|err| DeployError::Elb {
                dbg: err.to_string(),
            })?;
        Ok(())
    }

    async fn wait_for_health(
        &self,
        hostclass: &str,
        instance_ids: Option<&[String]>,
        testing: bool,
    ) -> DeployResult<Outcome> {
        let name = STATE.elb_name(&self.environment, hostclass, testing);
        let deadline = Instant::now() + STATE.elb_timeout;
        loop {
            if self.is_healthy(&name, instance_ids).await? {
                info!("Instances behind {} are in service", name);
                return Ok(Outcome::Passed);
            }
            if Instant::now() >= deadline {
                return Ok(Outcome::failed(format!(
                    "Timed out waiting for instances behind {} to be in service",
                    name
                )));
            }
            sleep(STATE.elb_poll_interval).await;
        }
    }
}
