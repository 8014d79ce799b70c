// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ami::{Ami, Stage},
    capacity::Capacity,
    error::DeployResult,
    outcome::Outcome,
    pipeline::PipelineEntry,
};
use async_trait::async_trait;
use std::time::SystemTime;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub image_id: String,
    pub hostclass: Option<String>,
    pub group_name: Option<String>,
    pub private_ip: Option<String>,
    pub state: String,
    pub smoketested: bool,
}

#[cfg(test)]
impl Instance {
    pub fn new(id: &str, image_id: &str) -> Self {
        Instance {
            id: id.to_string(),
            image_id: image_id.to_string(),
            hostclass: None,
            group_name: None,
            private_ip: None,
            state: "running".to_string(),
            smoketested: false,
        }
    }

    pub fn in_group(self, group_name: &str) -> Self {
        Instance {
            group_name: Some(group_name.to_string()),
            ..self
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub load_balancers: Vec<String>,
}

impl Group {
    pub fn capacity(&self) -> Capacity {
        Capacity::new(self.min_size, self.desired_capacity, self.max_size)
    }
}

/// Working copy of a pipeline entry with concrete sizes, handed to the
/// fleet to launch or resize a hostclass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentAttempt {
    pub hostclass: String,
    pub sequence: Option<u32>,
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
    pub deployable: bool,
    pub integration_test: Option<String>,
    pub smoke_test: bool,
    // None keeps the group's current launch image.
    pub ami: Option<String>,
    pub instance_type: Option<String>,
}

impl DeploymentAttempt {
    pub fn from_entry(entry: &PipelineEntry, capacity: Capacity) -> Self {
        DeploymentAttempt {
            hostclass: entry.hostclass.clone(),
            sequence: entry.sequence,
            min_size: capacity.min,
            desired_size: capacity.desired,
            max_size: capacity.max,
            deployable: entry.deployable,
            integration_test: entry.integration_test.clone(),
            smoke_test: false,
            ami: None,
            instance_type: entry.instance_type.clone(),
        }
    }

    pub fn with_sequence(self, sequence: Option<u32>) -> Self {
        DeploymentAttempt { sequence, ..self }
    }

    pub fn with_ami(self, ami: Option<&str>) -> Self {
        DeploymentAttempt {
            ami: ami.map(String::from),
            ..self
        }
    }

    pub fn capacity(&self) -> Capacity {
        Capacity::new(self.min_size, self.desired_size, self.max_size)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpinupOptions {
    // Launch without fixed addresses and behind the testing load balancer.
    pub testing: bool,
    // Create a new group even if the hostclass already has one.
    pub create_if_exists: bool,
    // Update this specific group rather than the hostclass' newest.
    pub group_name: Option<String>,
}

impl SpinupOptions {
    pub fn testing() -> Self {
        SpinupOptions {
            testing: true,
            ..Default::default()
        }
    }

    pub fn new_group() -> Self {
        SpinupOptions {
            testing: true,
            create_if_exists: true,
            group_name: None,
        }
    }

    pub fn for_group(group_name: &str) -> Self {
        SpinupOptions {
            group_name: Some(group_name.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub output: String,
}

impl RemoteOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Group size and image settings for one autoscaling group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRequest {
    pub hostclass: String,
    pub group_name: Option<String>,
    pub create_if_exists: bool,
    pub image_id: Option<String>,
    pub instance_type: String,
    pub capacity: Capacity,
    pub load_balancers: Vec<String>,
    pub testing: bool,
}

#[async_trait]
pub trait AmiRegistry: Send + Sync {
    /// Images owned by this account, optionally restricted to `ids`.
    async fn list_amis(&self, ids: Option<&[String]>) -> DeployResult<Vec<Ami>>;

    /// Images that still exist among `ids`. Deleted images are skipped.
    async fn get_amis(&self, ids: &[String]) -> DeployResult<Vec<Ami>>;

    async fn promote_ami(&self, ami: &Ami, stage: &Stage) -> DeployResult<()>;

    /// Share the image with the production accounts.
    async fn promote_ami_to_production(&self, ami: &Ami) -> DeployResult<()>;

    fn creation_time(&self, ami: &Ami) -> Option<SystemTime> {
        ami.created
    }

    fn prod_baker(&self) -> Option<String>;
}

#[async_trait]
pub trait GroupManager: Send + Sync {
    /// Newest group of the hostclass.
    async fn get_group(&self, hostclass: &str) -> DeployResult<Option<Group>>;

    async fn get_group_by_name(&self, name: &str) -> DeployResult<Option<Group>>;

    async fn create_or_update_group(&self, request: &GroupRequest) -> DeployResult<Group>;

    async fn delete_group(&self, name: &str, force: bool) -> DeployResult<()>;

    async fn delete_hostclass_groups(&self, hostclass: &str, force: bool) -> DeployResult<()>;

    /// Members of the named group.
    async fn list_instances(&self, group_name: &str) -> DeployResult<Vec<Instance>>;

    /// Terminate members and shrink the desired capacity to match.
    async fn terminate_via_autoscaler(&self, instance_ids: &[String]) -> DeployResult<()>;
}

#[async_trait]
pub trait LoadBalancerManager: Send + Sync {
    /// Returns the load balancer name.
    async fn get_or_create(&self, hostclass: &str, testing: bool) -> DeployResult<String>;

    async fn delete(&self, hostclass: &str, testing: bool) -> DeployResult<()>;

    /// Wait until the given instances, or every registered instance when
    /// `instance_ids` is None, are in service.
    async fn wait_for_health(
        &self,
        hostclass: &str,
        instance_ids: Option<&[String]>,
        testing: bool,
    ) -> DeployResult<Outcome>;
}

#[async_trait]
pub trait Fleet: Send + Sync {
    async fn spinup(
        &self,
        attempts: &[DeploymentAttempt],
        options: &SpinupOptions,
    ) -> DeployResult<()>;

    async fn remote_exec(
        &self,
        instance: &Instance,
        command: &[String],
        user: Option<&str>,
    ) -> DeployResult<RemoteOutput>;

    /// Wait for at least `min_count` running instances of the image.
    async fn wait_for_autoscaling(&self, ami_id: &str, min_count: u32) -> DeployResult<Outcome>;

    /// Wait for every instance to report smoke tested.
    async fn smoketest(&self, instances: &[Instance]) -> DeployResult<Outcome>;

    async fn smoketest_once(&self, instance: &Instance) -> DeployResult<bool>;

    /// All running instances in the environment.
    async fn instances(&self) -> DeployResult<Vec<Instance>>;

    async fn instances_from_amis(&self, ami_ids: &[String]) -> DeployResult<Vec<Instance>>;

    async fn instances_from_hostclass(&self, hostclass: &str) -> DeployResult<Vec<Instance>>;

    async fn get_instances(&self, instance_ids: &[String]) -> DeployResult<Vec<Instance>>;

    async fn terminate(&self, instances: &[Instance]) -> DeployResult<()>;
}
