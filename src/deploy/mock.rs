// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{AmiFilter, Collaborators, Deploy};
use crate::{
    ami::{Ami, Stage},
    config::DeployConfig,
    error::{DeployError, DeployResult},
    fleet::{
        AmiRegistry, DeploymentAttempt, Fleet, Group, GroupManager, GroupRequest, Instance,
        LoadBalancerManager, RemoteOutput, SpinupOptions,
    },
    outcome::Outcome,
    pipeline::{Pipeline, PipelineEntry},
    state::STATE,
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

const PIPELINE: &str = r#"[
    {"hostclass": "mhcintegrated", "min_size": 1, "desired_size": 1,
     "integration_test": "foo_service", "deployable": "yes"},
    {"hostclass": "mhcbluegreen", "min_size": 1, "desired_size": 1,
     "integration_test": "blue_green_service", "deployable": "yes"},
    {"hostclass": "mhcbluegreennondeployable", "min_size": 1, "desired_size": 1,
     "integration_test": "blue_green_service", "deployable": "no"},
    {"hostclass": "mhcsmokey", "min_size": 2, "desired_size": 2,
     "integration_test": null, "deployable": "yes"},
    {"hostclass": "mhcscarey", "min_size": 1, "desired_size": 1,
     "integration_test": null, "deployable": "no"},
    {"hostclass": "mhcfoo", "min_size": 1, "desired_size": 1,
     "integration_test": null, "deployable": "no"},
    {"hostclass": "mhctimedautoscale", "min_size": "3@30 16 * * 1-5:4@00 17 * * 1-5",
     "desired_size": "5@30 16 * * 1-5:6@00 17 * * 1-5",
     "max_size": "5@30 16 * * 1-5:6@00 17 * * 1-5",
     "integration_test": null, "deployable": "yes"}
]"#;

const STANDARD_AMIS: [(&str, Option<&str>); 18] = [
    ("mhcfoo 1", Some("untested")),
    ("mhcbar 2", Some("tested")),
    ("mhcfoo 4", Some("tested")),
    ("mhcfoo 5", None),
    ("mhcbar 1", Some("tested")),
    ("mhcfoo 2", Some("tested")),
    ("mhcfoo 3", Some("tested")),
    ("mhcfoo 6", Some("untested")),
    ("mhcnew 1", Some("untested")),
    ("mhcfoo 7", Some("failed")),
    ("mhcintegrated 1", None),
    ("mhcintegrated 2", Some("tested")),
    ("mhcintegrated 3", None),
    ("mhcbluegreen 1", Some("tested")),
    ("mhcbluegreen 2", Some("untested")),
    ("mhcbluegreennondeployable 1", Some("tested")),
    ("mhcbluegreennondeployable 2", Some("untested")),
    ("mhctimedautoscale 1", Some("untested")),
];

/// Side effects observed by the mocks, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    PromoteAmi {
        ami: String,
        stage: String,
    },
    PromoteToProduction {
        ami: String,
    },
    Spinup {
        attempts: Vec<DeploymentAttempt>,
        options: SpinupOptions,
    },
    RemoteExec {
        instance: String,
        command: Vec<String>,
        user: Option<String>,
    },
    WaitForAutoscaling {
        ami: String,
        min_count: u32,
    },
    Smoketest {
        instances: Vec<String>,
    },
    Terminate {
        instances: Vec<String>,
    },
    TerminateViaAutoscaler {
        instances: Vec<String>,
    },
    DeleteGroup {
        name: String,
        force: bool,
    },
    DeleteHostclassGroups {
        hostclass: String,
        force: bool,
    },
    DeleteElb {
        hostclass: String,
        testing: bool,
    },
    WaitForHealth {
        hostclass: String,
        instance_ids: Option<Vec<String>>,
        testing: bool,
    },
}

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Call>>>);

impl Recorder {
    fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn spinups(&self) -> Vec<(Vec<DeploymentAttempt>, SpinupOptions)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Spinup { attempts, options } => Some((attempts, options)),
                _ => None,
            })
            .collect()
    }

    /// `(ami id, stage)` of every stage tag written.
    pub fn promotions(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::PromoteAmi { ami, stage } => Some((ami, stage)),
                _ => None,
            })
            .collect()
    }

    pub fn remote_execs(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::RemoteExec { .. }))
            .collect()
    }

    pub fn autoscaler_terminations(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::TerminateViaAutoscaler { instances } => Some(instances),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_groups(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::DeleteGroup { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }
}

fn ids(instances: &[Instance]) -> Vec<String> {
    instances.iter().map(|instance| instance.id.clone()).collect()
}

// Hands out queued values in order, then falls back to a default.
#[derive(Default)]
struct Cursor(Mutex<usize>);

impl Cursor {
    fn next<T: Clone>(&self, queue: &VecDeque<T>) -> Option<T> {
        let mut at = self.0.lock().unwrap();
        let value = queue.get(*at).cloned();
        if value.is_some() {
            *at += 1;
        }
        value
    }
}

pub struct MockRegistry {
    pub amis: Vec<Ami>,
    pub fail_promotion: bool,
    pub prod_baker: Option<String>,
    calls: Recorder,
}

#[async_trait]
impl AmiRegistry for MockRegistry {
    async fn list_amis(&self, ids: Option<&[String]>) -> DeployResult<Vec<Ami>> {
        Ok(match ids {
            Some(ids) => self.get_amis(ids).await?,
            None => self.amis.clone(),
        })
    }

    async fn get_amis(&self, ids: &[String]) -> DeployResult<Vec<Ami>> {
        Ok(self
            .amis
            .iter()
            .filter(|ami| ids.contains(&ami.id))
            .cloned()
            .collect())
    }

    async fn promote_ami(&self, ami: &Ami, stage: &Stage) -> DeployResult<()> {
        if self.fail_promotion {
            return Err(DeployError::Ec2 {
                dbg: "tagging is broken".to_string(),
            });
        }
        self.calls.record(Call::PromoteAmi {
            ami: ami.id.clone(),
            stage: stage.to_string(),
        });
        Ok(())
    }

    async fn promote_ami_to_production(&self, ami: &Ami) -> DeployResult<()> {
        self.calls.record(Call::PromoteToProduction {
            ami: ami.id.clone(),
        });
        Ok(())
    }

    fn prod_baker(&self) -> Option<String> {
        self.prod_baker.clone()
    }
}

pub struct MockGroups {
    // Returned by `get_group` once `lookups` is exhausted.
    pub default_group: Option<Group>,
    pub lookups: VecDeque<Option<Group>>,
    pub members: Vec<Instance>,
    cursor: Cursor,
    calls: Recorder,
}

#[async_trait]
impl GroupManager for MockGroups {
    async fn get_group(&self, _hostclass: &str) -> DeployResult<Option<Group>> {
        Ok(self
            .cursor
            .next(&self.lookups)
            .unwrap_or_else(|| self.default_group.clone()))
    }

    async fn get_group_by_name(&self, name: &str) -> DeployResult<Option<Group>> {
        Ok(self
            .lookups
            .iter()
            .flatten()
            .chain(self.default_group.iter())
            .find(|group| group.name == name)
            .cloned())
    }

    async fn create_or_update_group(&self, request: &GroupRequest) -> DeployResult<Group> {
        Ok(Group {
            name: request
                .group_name
                .clone()
                .unwrap_or_else(|| format!("ci_{}_1", request.hostclass)),
            min_size: request.capacity.min,
            max_size: request.capacity.max,
            desired_capacity: request.capacity.desired,
            load_balancers: request.load_balancers.clone(),
        })
    }

    async fn delete_group(&self, name: &str, force: bool) -> DeployResult<()> {
        self.calls.record(Call::DeleteGroup {
            name: name.to_string(),
            force,
        });
        Ok(())
    }

    async fn delete_hostclass_groups(&self, hostclass: &str, force: bool) -> DeployResult<()> {
        self.calls.record(Call::DeleteHostclassGroups {
            hostclass: hostclass.to_string(),
            force,
        });
        Ok(())
    }

    async fn list_instances(&self, group_name: &str) -> DeployResult<Vec<Instance>> {
        Ok(self
            .members
            .iter()
            .filter(|instance| instance.group_name.as_deref() == Some(group_name))
            .cloned()
            .collect())
    }

    async fn terminate_via_autoscaler(&self, instance_ids: &[String]) -> DeployResult<()> {
        self.calls.record(Call::TerminateViaAutoscaler {
            instances: instance_ids.to_vec(),
        });
        Ok(())
    }
}

pub struct MockElb {
    // Consumed by successive health waits. Passed once exhausted.
    pub health: VecDeque<Outcome>,
    cursor: Cursor,
    calls: Recorder,
}

#[async_trait]
impl LoadBalancerManager for MockElb {
    async fn get_or_create(&self, hostclass: &str, testing: bool) -> DeployResult<String> {
        Ok(STATE.elb_name("ci", hostclass, testing))
    }

    async fn delete(&self, hostclass: &str, testing: bool) -> DeployResult<()> {
        self.calls.record(Call::DeleteElb {
            hostclass: hostclass.to_string(),
            testing,
        });
        Ok(())
    }

    async fn wait_for_health(
        &self,
        hostclass: &str,
        instance_ids: Option<&[String]>,
        testing: bool,
    ) -> DeployResult<Outcome> {
        self.calls.record(Call::WaitForHealth {
            hostclass: hostclass.to_string(),
            instance_ids: instance_ids.map(<[String]>::to_vec),
            testing,
        });
        Ok(self.cursor.next(&self.health).unwrap_or(Outcome::Passed))
    }
}

pub struct MockFleet {
    pub instances: Vec<Instance>,
    pub autoscaling: Outcome,
    pub smoke: Outcome,
    // Exit code for commands containing the pattern. 0 when nothing matches.
    pub exit_codes: Vec<(&'static str, i32)>,
    // Exit codes handed out in order ahead of `exit_codes`.
    pub exit_sequence: VecDeque<i32>,
    // Commands containing one of these never report back.
    pub unreachable: Vec<&'static str>,
    cursor: Cursor,
    calls: Recorder,
}

impl MockFleet {
    fn new(calls: Recorder) -> Self {
        MockFleet {
            instances: Vec::new(),
            autoscaling: Outcome::Passed,
            smoke: Outcome::Passed,
            exit_codes: Vec::new(),
            exit_sequence: VecDeque::new(),
            unreachable: Vec::new(),
            cursor: Cursor::default(),
            calls,
        }
    }

    fn exit_code(&self, command: &str) -> i32 {
        if let Some(code) = self.cursor.next(&self.exit_sequence) {
            return code;
        }
        self.exit_codes
            .iter()
            .find(|(pattern, _)| command.contains(pattern))
            .map_or(0, |(_, code)| *code)
    }
}

#[async_trait]
impl Fleet for MockFleet {
    async fn spinup(
        &self,
        attempts: &[DeploymentAttempt],
        options: &SpinupOptions,
    ) -> DeployResult<()> {
        self.calls.record(Call::Spinup {
            attempts: attempts.to_vec(),
            options: options.clone(),
        });
        Ok(())
    }

    async fn remote_exec(
        &self,
        instance: &Instance,
        command: &[String],
        user: Option<&str>,
    ) -> DeployResult<RemoteOutput> {
        self.calls.record(Call::RemoteExec {
            instance: instance.id.clone(),
            command: command.to_vec(),
            user: user.map(String::from),
        });
        let command = command.join(" ");
        if self.unreachable.iter().any(|pattern| command.contains(pattern)) {
            return Err(DeployError::Ssm {
                dbg: format!("Command on {} timed out", instance.id),
            });
        }
        let exit_code = self.exit_code(&command);
        Ok(RemoteOutput {
            exit_code,
            output: if exit_code == 0 { "Okay" } else { "Not Okay" }.to_string(),
        })
    }

    async fn wait_for_autoscaling(&self, ami_id: &str, min_count: u32) -> DeployResult<Outcome> {
        self.calls.record(Call::WaitForAutoscaling {
            ami: ami_id.to_string(),
            min_count,
        });
        Ok(self.autoscaling.clone())
    }

    async fn smoketest(&self, instances: &[Instance]) -> DeployResult<Outcome> {
        self.calls.record(Call::Smoketest {
            instances: ids(instances),
        });
        Ok(self.smoke.clone())
    }

    async fn smoketest_once(&self, instance: &Instance) -> DeployResult<bool> {
        Ok(instance.smoketested)
    }

    async fn instances(&self) -> DeployResult<Vec<Instance>> {
        Ok(self.instances.clone())
    }

    async fn instances_from_amis(&self, ami_ids: &[String]) -> DeployResult<Vec<Instance>> {
        Ok(self
            .instances
            .iter()
            .filter(|instance| ami_ids.contains(&instance.image_id))
            .cloned()
            .collect())
    }

    async fn instances_from_hostclass(&self, hostclass: &str) -> DeployResult<Vec<Instance>> {
        Ok(self
            .instances
            .iter()
            .filter(|instance| instance.hostclass.as_deref() == Some(hostclass))
            .cloned()
            .collect())
    }

    async fn get_instances(&self, instance_ids: &[String]) -> DeployResult<Vec<Instance>> {
        Ok(self
            .instances
            .iter()
            .filter(|instance| instance_ids.contains(&instance.id))
            .cloned()
            .collect())
    }

    async fn terminate(&self, instances: &[Instance]) -> DeployResult<()> {
        self.calls.record(Call::Terminate {
            instances: ids(instances),
        });
        Ok(())
    }
}

pub fn instance(id: &str, image_id: &str, group_name: Option<&str>) -> Instance {
    let instance = Instance::new(id, image_id);
    match group_name {
        Some(name) => instance.in_group(name),
        None => instance,
    }
}

pub fn test_host(id: &str, hostclass: &str, smoketested: bool) -> Instance {
    Instance {
        hostclass: Some(hostclass.to_string()),
        smoketested,
        ..Instance::new(id, "ami-test-host")
    }
}

pub fn group(name: &str, min_size: u32, desired_capacity: u32, max_size: u32) -> Group {
    Group {
        name: name.to_string(),
        min_size,
        max_size,
        desired_capacity,
        load_balancers: Vec::new(),
    }
}

pub fn config() -> DeployConfig {
    DeployConfig::from_sections(&[
        (
            "test",
            &[
                ("test_user", "test_user"),
                ("command", "test_command"),
                ("hostclass", "test_hostclass"),
            ],
        ),
        (
            "hostclass_being_tested",
            &[("test_hostclass", "another_test_hostclass")],
        ),
        (
            "mhcbluegreen",
            &[("deployment_strategy", "blue_green"), ("elb", "yes")],
        ),
        (
            "mhcbluegreennondeployable",
            &[("deployment_strategy", "blue_green")],
        ),
    ])
}

pub fn pipeline() -> Pipeline {
    let entries: Vec<PipelineEntry> = serde_json::from_str(PIPELINE).unwrap();
    Pipeline::new(entries)
}

/// Mock collaborators around the standard pipeline and config.
pub struct Harness {
    pub registry: MockRegistry,
    pub fleet: MockFleet,
    pub test_fleet: MockFleet,
    pub groups: MockGroups,
    pub elb: MockElb,
    pub pipeline: Pipeline,
    pub config: DeployConfig,
    pub filter: AmiFilter,
    pub calls: Recorder,
}

impl Harness {
    pub fn new() -> Self {
        let calls = Recorder::default();
        Harness {
            registry: MockRegistry {
                amis: Vec::new(),
                fail_promotion: false,
                prod_baker: None,
                calls: calls.clone(),
            },
            fleet: MockFleet::new(calls.clone()),
            test_fleet: MockFleet::new(calls.clone()),
            groups: MockGroups {
                default_group: None,
                lookups: VecDeque::new(),
                members: Vec::new(),
                cursor: Cursor::default(),
                calls: calls.clone(),
            },
            elb: MockElb {
                health: VecDeque::new(),
                cursor: Cursor::default(),
                calls: calls.clone(),
            },
            pipeline: pipeline(),
            config: config(),
            filter: AmiFilter::default(),
            calls,
        }
    }

    /// Ids are derived from the name: `mhcfoo 4` is `ami-mhcfoo-4`.
    pub fn with_standard_amis() -> Self {
        let mut harness = Harness::new();
        harness.registry.amis = STANDARD_AMIS
            .iter()
            .map(|(name, stage)| {
                Ami::new(
                    &format!("ami-{}", name.replace(' ', "-")),
                    name,
                    stage.map(Stage::from_tag),
                )
            })
            .collect();
        harness
    }

    pub fn ami(&self, name: &str) -> Ami {
        self.registry
            .amis
            .iter()
            .find(|ami| ami.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no AMI named {}", name))
    }

    /// Run the instance and, when it has a group, make it a member.
    pub fn add_instance(&mut self, instance: Instance) {
        if instance.group_name.is_some() {
            self.groups.members.push(instance.clone());
        }
        self.fleet.instances.push(instance);
    }

    pub fn build(self) -> Deploy {
        let collaborators = Collaborators {
            registry: Arc::new(self.registry),
            fleet: Arc::new(self.fleet),
            test_fleet: Arc::new(self.test_fleet),
            groups: Arc::new(self.groups),
            elb: Arc::new(self.elb),
        };
        Deploy::new(collaborators, self.pipeline, self.config, self.filter)
    }
}
