// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ami::Ami,
    autoscale_utils::AwsGroupManager,
    aws_fleet::{AwsFleet, Timeouts},
    config::DeployConfig,
    deploy::{AmiFilter, Collaborators, Deploy},
    duration::{display_time, parse_duration},
    ec2_utils::AwsAmiRegistry,
    elb_utils::AwsLoadBalancerManager,
    error::{DeployError, DeployResult},
    fleet::{Fleet, GroupManager, LoadBalancerManager},
    outcome::DeployOutcome,
    pipeline::Pipeline,
    state::STATE,
    strategy::DeploymentStrategy,
};
use aws_types::region::Region;
use clap::{ArgGroup, Args, Parser, Subcommand};
use core::time::Duration;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};

/// Test and roll out freshly baked AMIs.
#[derive(Parser, Debug)]
#[command(name = "asiaq-deploy", version = STATE.version)]
pub struct Cli {
    /// Path to the deployment config file
    #[arg(long, default_value = "disco_aws.json")]
    config: PathBuf,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,

    /// Decide what to do without touching any resources
    #[arg(long, global = true)]
    dry_run: bool,

    /// Also write a daily rolling log file to this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// How long instances get to pass their smoke test, e.g. `10m`
    #[arg(long, global = true, value_parser = parse_duration)]
    smoketest_timeout: Option<Duration>,

    /// How long autoscaling gets to bring instances up
    #[arg(long, global = true, value_parser = parse_duration)]
    autoscale_timeout: Option<Duration>,

    /// How long a remote command may run before it counts as failed
    #[arg(long, global = true, value_parser = parse_duration)]
    ssm_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Test one untested AMI, deploying it if the hostclass allows it
    Test(TestArgs),
    /// Deploy one newer AMI to a hostclass of the pipeline
    Update(UpdateArgs),
    /// Print AMIs of one category
    List(ListArgs),
}

#[derive(Args, Debug, Clone)]
struct Selection {
    /// Only consider this AMI
    #[arg(long, conflicts_with = "hostclass")]
    ami: Option<String>,

    /// Only consider AMIs of this hostclass
    #[arg(long)]
    hostclass: Option<String>,

    /// Consider AMIs of hostclasses outside the pipeline
    #[arg(long)]
    allow_any_hostclass: bool,
}

impl Selection {
    fn into_filter(self) -> AmiFilter {
        AmiFilter {
            ami: self.ami,
            hostclass: self.hostclass,
            allow_any_hostclass: self.allow_any_hostclass,
        }
    }
}

#[derive(Args, Debug)]
struct TestArgs {
    #[arg(long)]
    pipeline: PathBuf,

    #[arg(long)]
    environment: Option<String>,

    #[arg(long, value_enum)]
    strategy: Option<DeploymentStrategy>,

    #[command(flatten)]
    selection: Selection,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    #[arg(long)]
    pipeline: PathBuf,

    #[arg(long)]
    environment: String,

    #[arg(long, value_enum)]
    strategy: Option<DeploymentStrategy>,

    #[command(flatten)]
    selection: Selection,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("category")
        .required(true)
        .args(["tested", "untested", "failed", "failures", "testable", "updatable"]),
))]
struct ListArgs {
    /// Latest tested AMI per hostclass
    #[arg(long)]
    tested: bool,

    /// Latest untested AMI per hostclass
    #[arg(long)]
    untested: bool,

    /// Latest failed AMI per hostclass
    #[arg(long)]
    failed: bool,

    /// Failed AMIs newer than the latest tested one; exits 1 if any
    #[arg(long)]
    failures: bool,

    /// AMIs `test` would pick from
    #[arg(long)]
    testable: bool,

    /// AMIs `update` would pick from
    #[arg(long, requires_all = ["pipeline", "environment"])]
    updatable: bool,

    #[arg(long)]
    pipeline: Option<PathBuf>,

    #[arg(long)]
    environment: Option<String>,

    #[command(flatten)]
    selection: Selection,
}

impl Cli {
    fn timeouts(&self) -> Timeouts {
        let defaults = Timeouts::default();
        Timeouts {
            smoketest: self.smoketest_timeout.unwrap_or(defaults.smoketest),
            autoscale: self.autoscale_timeout.unwrap_or(defaults.autoscale),
            ssm: self.ssm_timeout.unwrap_or(defaults.ssm),
        }
    }

    /// Process exit code of the run.
    pub async fn run(self) -> DeployResult<i32> {
        let config = DeployConfig::from_file(&self.config)?;
        let dry_run = self.dry_run;
        let timeouts = self.timeouts();

        match self.command {
            Command::Test(args) => {
                let environment = environment(args.environment, &config)?;
                let pipeline = Pipeline::from_file(&args.pipeline)?;
                debug!(hostclasses = ?pipeline.hostclasses().collect::<Vec<_>>(), "pipeline");
                let deploy =
                    build_deploy(&config, &environment, pipeline, args.selection, timeouts).await;
                let outcome = deploy.test(args.strategy, dry_run).await?;
                report(&environment, "test", &outcome);
                Ok(0)
            }
            Command::Update(args) => {
                let pipeline = Pipeline::from_file(&args.pipeline)?;
                debug!(hostclasses = ?pipeline.hostclasses().collect::<Vec<_>>(), "pipeline");
                let deploy = build_deploy(
                    &config,
                    &args.environment,
                    pipeline,
                    args.selection,
                    timeouts,
                )
                .await;
                let outcome = deploy.update(args.strategy, dry_run).await?;
                report(&args.environment, "update", &outcome);
                Ok(0)
            }
            Command::List(args) => list(args, &config, timeouts).await,
        }
    }
}

fn report(environment: &str, command: &str, outcome: &DeployOutcome) {
    if outcome.is_success() {
        info!(environment, "{} finished: {}", command, outcome);
    } else {
        warn!(environment, "{} finished: {}", command, outcome);
    }
}

fn environment(explicit: Option<String>, config: &DeployConfig) -> DeployResult<String> {
    explicit
        .or_else(|| config.default_environment().map(String::from))
        .ok_or(DeployError::Config {
            dbg: "No environment given and no default_environment configured".to_string(),
        })
}

async fn list(args: ListArgs, config: &DeployConfig, timeouts: Timeouts) -> DeployResult<i32> {
    let pipeline = match &args.pipeline {
        Some(path) => Pipeline::from_file(path)?,
        None => Pipeline::default(),
    };
    // Only `--updatable` looks at running instances.
    let environment = args
        .environment
        .clone()
        .or_else(|| config.default_environment().map(String::from))
        .unwrap_or_default();
    let deploy = build_deploy(
        config,
        &environment,
        pipeline,
        args.selection.clone(),
        timeouts,
    )
    .await;

    let amis: Vec<Ami> = if args.tested {
        deploy.latest_tested_amis().await?.into_values().collect()
    } else if args.untested {
        deploy.latest_untested_amis().await?.into_values().collect()
    } else if args.failed {
        deploy.latest_failed_amis().await?.into_values().collect()
    } else if args.failures {
        deploy.failed_amis().await?
    } else if args.testable {
        deploy.test_amis().await?
    } else {
        deploy.update_amis().await?
    };

    for ami in amis.iter() {
        println!("{}", list_line(&deploy, ami));
        debug!(ami = %ami.id, created = %display_time(ami.created), "listed");
    }

    Ok(if args.failures && !amis.is_empty() { 1 } else { 0 })
}

fn list_line(deploy: &Deploy, ami: &Ami) -> String {
    let missing = if deploy.pipeline().is_defined() { "-" } else { "" };
    format!(
        "{} {:40} {}",
        ami.id,
        ami.hostclass(),
        deploy.integration_test(ami.hostclass()).unwrap_or(missing)
    )
}

fn environment_backend(
    shared_config: &aws_types::SdkConfig,
    config: &DeployConfig,
    environment: &str,
    timeouts: Timeouts,
) -> (Arc<dyn Fleet>, Arc<dyn GroupManager>, Arc<dyn LoadBalancerManager>) {
    let ec2_client = aws_sdk_ec2::Client::new(shared_config);
    let groups: Arc<dyn GroupManager> = Arc::new(AwsGroupManager::new(
        aws_sdk_autoscaling::Client::new(shared_config),
        ec2_client.clone(),
        environment,
        config.clone(),
    ));
    let elb: Arc<dyn LoadBalancerManager> = Arc::new(AwsLoadBalancerManager::new(
        aws_sdk_elasticloadbalancing::Client::new(shared_config),
        environment,
        config.clone(),
    ));
    let fleet: Arc<dyn Fleet> = Arc::new(AwsFleet::new(
        ec2_client,
        aws_sdk_ssm::Client::new(shared_config),
        environment,
        config.clone(),
        groups.clone(),
        elb.clone(),
        timeouts,
    ));
    (fleet, groups, elb)
}

async fn build_deploy(
    config: &DeployConfig,
    environment: &str,
    pipeline: Pipeline,
    selection: Selection,
    timeouts: Timeouts,
) -> Deploy {
    let region = Region::new(config.region().to_string());
    let shared_config = aws_config::from_env().region(region).load().await;

    let (fleet, groups, elb) = environment_backend(&shared_config, config, environment, timeouts);
    let test_fleet = match config.test_environment() {
        Some(test_environment) if test_environment != environment => {
            debug!("integration tests run from {}", test_environment);
            environment_backend(&shared_config, config, test_environment, timeouts).0
        }
        _ => fleet.clone(),
    };

    let collaborators = Collaborators {
        registry: Arc::new(AwsAmiRegistry::new(
            aws_sdk_ec2::Client::new(&shared_config),
            config,
        )),
        fleet,
        test_fleet,
        groups,
        elb,
    };
    Deploy::new(
        collaborators,
        pipeline,
        config.clone(),
        selection.into_filter(),
    )
}
