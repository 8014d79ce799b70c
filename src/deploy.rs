// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ami::{Ami, Stage},
    config::DeployConfig,
    error::{DeployError, DeployResult},
    fleet::{AmiRegistry, Fleet, GroupManager, LoadBalancerManager},
    outcome::DeployOutcome,
    pipeline::{Pipeline, PipelineEntry},
    strategy::DeploymentStrategy,
};
use rand::seq::SliceRandom;
use std::{collections::BTreeSet, sync::Arc, time::SystemTime};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

mod blue_green;
mod classic;
#[cfg(test)]
mod mock;
mod selection;
mod testing;

pub use selection::{AmiMap, StageFilter};

/// AWS-facing collaborators of a deploy run.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn AmiRegistry>,
    pub fleet: Arc<dyn Fleet>,
    // Fleet hosting the integration test hosts. May be a different
    // environment than `fleet`.
    pub test_fleet: Arc<dyn Fleet>,
    pub groups: Arc<dyn GroupManager>,
    pub elb: Arc<dyn LoadBalancerManager>,
}

/// Narrows the AMIs a run considers.
#[derive(Clone, Debug, Default)]
pub struct AmiFilter {
    pub ami: Option<String>,
    pub hostclass: Option<String>,
    pub allow_any_hostclass: bool,
}

pub struct Deploy {
    registry: Arc<dyn AmiRegistry>,
    fleet: Arc<dyn Fleet>,
    test_fleet: Arc<dyn Fleet>,
    groups: Arc<dyn GroupManager>,
    elb: Arc<dyn LoadBalancerManager>,
    pipeline: Pipeline,
    config: DeployConfig,
    filter: AmiFilter,
    all_stage_amis: OnceCell<Vec<Ami>>,
}

impl Deploy {
    pub fn new(
        collaborators: Collaborators,
        pipeline: Pipeline,
        config: DeployConfig,
        filter: AmiFilter,
    ) -> Self {
        Deploy {
            registry: collaborators.registry,
            fleet: collaborators.fleet,
            test_fleet: collaborators.test_fleet,
            groups: collaborators.groups,
            elb: collaborators.elb,
            pipeline,
            config,
            filter,
            all_stage_amis: OnceCell::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn creation_time(&self, ami: &Ami) -> Option<SystemTime> {
        self.registry.creation_time(ami)
    }

    fn filter_amis(&self, amis: Vec<Ami>) -> Vec<Ami> {
        if let Some(id) = &self.filter.ami {
            amis.into_iter().filter(|ami| &ami.id == id).collect()
        } else if let Some(hostclass) = &self.filter.hostclass {
            amis.into_iter()
                .filter(|ami| ami.hostclass() == hostclass)
                .collect()
        } else if !self.filter.allow_any_hostclass {
            amis.into_iter()
                .filter(|ami| self.pipeline.contains(ami.hostclass()))
                .collect()
        } else {
            amis
        }
    }

    /// Available AMIs matching the filter. Fetched once per run.
    pub async fn all_stage_amis(&self) -> DeployResult<&[Ami]> {
        let amis = self
            .all_stage_amis
            .get_or_try_init(|| async {
                let restrict = self.filter.ami.clone().map(|id| vec![id]);
                let amis = self.registry.list_amis(restrict.as_deref()).await?;
                let amis: Vec<Ami> = self
                    .filter_amis(amis)
                    .into_iter()
                    .filter(Ami::is_available)
                    .collect();
                Ok::<_, DeployError>(amis)
            })
            .await?;
        Ok(amis.as_slice())
    }

    fn untested_stage(&self) -> String {
        self.config
            .ami_stages()
            .first()
            .cloned()
            .unwrap_or_else(|| Stage::Untested.to_string())
    }

    fn tested_stage(&self) -> String {
        self.config
            .ami_stages()
            .last()
            .cloned()
            .unwrap_or_else(|| Stage::Tested.to_string())
    }

    pub async fn latest_ami_in_stage(&self, filter: StageFilter<'_>) -> DeployResult<AmiMap> {
        let amis = self.all_stage_amis().await?;
        Ok(selection::latest_in_stage(amis, filter, |ami| {
            self.creation_time(ami)
        }))
    }

    pub async fn latest_untested_amis(&self) -> DeployResult<AmiMap> {
        let stage = self.untested_stage();
        self.latest_ami_in_stage(StageFilter::Tagged(&stage)).await
    }

    pub async fn latest_untagged_amis(&self) -> DeployResult<AmiMap> {
        self.latest_ami_in_stage(StageFilter::Untagged).await
    }

    pub async fn latest_tested_amis(&self) -> DeployResult<AmiMap> {
        let stage = self.tested_stage();
        self.latest_ami_in_stage(StageFilter::Tagged(&stage)).await
    }

    pub async fn latest_failed_amis(&self) -> DeployResult<AmiMap> {
        self.latest_ami_in_stage(StageFilter::Tagged(Stage::Failed.as_str()))
            .await
    }

    /// Untested AMIs newer than the newest tested AMI of their hostclass.
    pub async fn test_amis(&self) -> DeployResult<Vec<Ami>> {
        let tested = self.latest_tested_amis().await?;
        let untested = self.latest_untested_amis().await?;
        Ok(selection::newer_in_second(&tested, &untested, |ami| {
            self.creation_time(ami)
        }))
    }

    /// Failed AMIs newer than the newest tested AMI of their hostclass.
    pub async fn failed_amis(&self) -> DeployResult<Vec<Ami>> {
        let tested = self.latest_tested_amis().await?;
        let failed = self.latest_failed_amis().await?;
        Ok(selection::newer_in_second(&tested, &failed, |ami| {
            self.creation_time(ami)
        }))
    }

    /// Newest image per hostclass among everything running in the
    /// environment.
    pub async fn latest_running_amis(&self) -> DeployResult<AmiMap> {
        let running_ids: BTreeSet<String> = self
            .fleet
            .instances()
            .await?
            .into_iter()
            .map(|instance| instance.image_id)
            .collect();
        let running_ids: Vec<String> = running_ids.into_iter().collect();
        let running = self.registry.get_amis(&running_ids).await?;
        Ok(selection::newest_per_hostclass(running, |ami| {
            self.creation_time(ami)
        }))
    }

    /// AMIs ready to go to production: newer than what is running, for a
    /// deployable hostclass of the pipeline.
    pub async fn update_amis(&self) -> DeployResult<Vec<Ami>> {
        let tested = self.latest_tested_amis().await?;
        let untagged = self.latest_untagged_amis().await?;
        let available = selection::newest_in_either(tested, untagged, |ami| {
            self.creation_time(ami)
        });
        let running = self.latest_running_amis().await?;
        let newer = selection::newer_in_second(&running, &available, |ami| {
            self.creation_time(ami)
        });
        Ok(newer
            .into_iter()
            .filter(|ami| {
                self.pipeline.contains(ami.hostclass()) && self.is_deployable(ami.hostclass())
            })
            .collect())
    }

    /// Hostclasses missing from the pipeline count as deployable.
    pub fn is_deployable(&self, hostclass: &str) -> bool {
        self.pipeline
            .get(hostclass)
            .map_or(true, |entry| entry.deployable)
    }

    pub fn integration_test(&self, hostclass: &str) -> Option<&str> {
        self.pipeline
            .get(hostclass)
            .and_then(|entry| entry.integration_test.as_deref())
    }

    pub fn strategy_for(
        &self,
        hostclass: &str,
        explicit: Option<DeploymentStrategy>,
    ) -> DeployResult<DeploymentStrategy> {
        DeploymentStrategy::resolve(
            explicit,
            self.pipeline
                .get(hostclass)
                .and_then(|entry| entry.deployment_strategy),
            self.config.deployment_strategy(hostclass),
        )
    }

    /// Tag the AMI and, for tested AMIs of the production baker, share it
    /// with production. Failures are logged and never propagated.
    pub async fn promote_ami(&self, ami: &Ami, stage: &str) {
        let stage = Stage::from_tag(stage);
        if let Err(err) = self.registry.promote_ami(ami, &stage).await {
            error!(ami = %ami.id, %stage, "promotion failed: {}", err);
            return;
        }

        let prod_baker = self.registry.prod_baker();
        let is_prod_build = prod_baker.is_some() && ami.baker == prod_baker;
        if stage.as_str() == self.tested_stage() && is_prod_build {
            if let Err(err) = self.registry.promote_ami_to_production(ami).await {
                error!(ami = %ami.id, "promotion to production failed: {}", err);
            }
        }
    }

    async fn group_desired_capacity(&self, hostclass: &str) -> DeployResult<Option<u32>> {
        Ok(self
            .groups
            .get_group(hostclass)
            .await?
            .map(|group| group.desired_capacity))
    }

    /// Test and promote a single AMI.
    pub async fn test_ami(
        &self,
        ami: &Ami,
        strategy: Option<DeploymentStrategy>,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        info!(ami = %ami.id, name = %ami.name, "testing");
        let hostclass = ami.hostclass();
        if self.strategy_for(hostclass, strategy)? == DeploymentStrategy::BlueGreen {
            return self.handle_blue_green_ami(ami, dry_run).await;
        }

        let entry = self.pipeline.get(hostclass);
        let desired = self.group_desired_capacity(hostclass).await?.unwrap_or(0);
        match entry {
            _ if !self.is_deployable(hostclass) => {
                self.handle_nodeploy_ami(entry, ami, desired, dry_run).await
            }
            Some(entry) if self.integration_test(hostclass).is_some() => {
                self.handle_tested_ami(entry, ami, desired, true, dry_run)
                    .await
            }
            Some(entry) => {
                self.handle_tested_ami(entry, ami, desired, false, dry_run)
                    .await
            }
            None => self.handle_nodeploy_ami(None, ami, 0, dry_run).await,
        }
    }

    /// Roll a hostclass of the pipeline forward to the given AMI.
    pub async fn update_ami(
        &self,
        ami: &Ami,
        strategy: Option<DeploymentStrategy>,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        info!(ami = %ami.id, name = %ami.name, "updating");
        let hostclass = ami.hostclass();
        let entry: &PipelineEntry = match self.pipeline.get(hostclass) {
            Some(entry) => entry,
            None => {
                warn!(hostclass, "not in the pipeline, nothing to update");
                return Ok(DeployOutcome::NothingToDo);
            }
        };

        let desired = match self.group_desired_capacity(hostclass).await? {
            Some(desired) => desired,
            None => entry.desired_count().unwrap_or(0),
        };

        if self.strategy_for(hostclass, strategy)? == DeploymentStrategy::BlueGreen {
            self.handle_blue_green_ami(ami, dry_run).await
        } else if !self.is_deployable(hostclass) {
            self.handle_nodeploy_ami(Some(entry), ami, desired, dry_run)
                .await
        } else {
            self.handle_tested_ami(entry, ami, desired, false, dry_run)
                .await
        }
    }

    /// Test one randomly chosen test candidate.
    pub async fn test(
        &self,
        strategy: Option<DeploymentStrategy>,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        let amis = self.test_amis().await?;
        match amis.choose(&mut rand::thread_rng()) {
            Some(ami) => self.test_ami(ami, strategy, dry_run).await,
            None => {
                info!("no AMIs to test");
                Ok(DeployOutcome::NothingToDo)
            }
        }
    }

    /// Deploy one randomly chosen update candidate.
    pub async fn update(
        &self,
        strategy: Option<DeploymentStrategy>,
        dry_run: bool,
    ) -> DeployResult<DeployOutcome> {
        let amis = self.update_amis().await?;
        match amis.choose(&mut rand::thread_rng()) {
            Some(ami) => self.update_ami(ami, strategy, dry_run).await,
            None => {
                info!("no AMIs to update");
                Ok(DeployOutcome::NothingToDo)
            }
        }
    }
}
