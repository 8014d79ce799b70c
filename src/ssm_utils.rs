// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{DeployError, DeployResult},
    fleet::RemoteOutput,
    state::STATE,
};
use aws_sdk_ssm as ssm;
use core::time::Duration;
use ssm::types::CommandInvocationStatus;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const SEND_ATTEMPTS: u32 = 5;

/// Quote an argument for `sh` unless it is made of plain characters.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

pub fn shell_command(command: &[String], user: Option<&str>) -> String {
    let command = command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    match user {
        Some(user) => format!("runuser -u {} -- {}", user, command),
        None => command,
    }
}

fn exit_code(code: impl Into<Option<i32>>) -> Option<i32> {
    code.into().filter(|code| *code >= 0)
}

/// What a command that never reported back looks like to callers.
fn timed_out(command_id: &str, instance_id: &str, timeout: Duration) -> RemoteOutput {
    RemoteOutput {
        exit_code: 1,
        output: format!(
            "Command {} on {} timed out after {}",
            command_id,
            instance_id,
            humantime::format_duration(timeout)
        ),
    }
}

async fn send_command(
    ssm_client: &ssm::Client,
    instance_id: &str,
    commands: Vec<String>,
) -> DeployResult<String> {
    let mut remaining_try_count = SEND_ATTEMPTS;
    loop {
        let result = ssm_client
            .send_command()
            .instance_ids(instance_id)
            .document_name("AWS-RunShellScript")
            .document_version("$LATEST")
            .parameters("commands", commands.clone())
            .send()
            .await;
        match result {
            Ok(sent) => {
                return sent
                    .command()
                    .and_then(|command| command.command_id())
                    .map(String::from)
                    .ok_or(DeployError::Ssm {
                        dbg: format!("No command id for {}", instance_id),
                    })
            }
            Err(err) if remaining_try_count > 0 => {
                warn!("Unable to send command to {}: {}", instance_id, err);
                remaining_try_count -= 1;
                sleep(STATE.ssm_poll_interval).await;
            }
            Err(err) => {
                return Err(DeployError::Ssm {
                    dbg: err.to_string(),
                })
            }
        }
    }
}

/// Run `command` on the instance and wait up to `timeout` for it to finish.
/// A command still running at the deadline counts as failed.
pub async fn run_command(
    ssm_client: &ssm::Client,
    instance_id: &str,
    command: &[String],
    user: Option<&str>,
    timeout: Duration,
) -> DeployResult<RemoteOutput> {
    let shell = shell_command(command, user);
    debug!("{}: {}", instance_id, shell);
    let command_id = send_command(ssm_client, instance_id, vec![shell]).await?;

    let deadline = Instant::now() + timeout;
    loop {
        sleep(STATE.ssm_poll_interval).await;
        if Instant::now() >= deadline {
            warn!("Command {} on {} timed out", command_id, instance_id);
            return Ok(timed_out(&command_id, instance_id, timeout));
        }

        // The invocation isn't visible for a moment after it is sent.
        let invocation = match ssm_client
            .get_command_invocation()
            .command_id(&command_id)
            .instance_id(instance_id)
            .send()
            .await
        {
            Ok(invocation) => invocation,
            Err(err) => {
                debug!("Invocation {} not ready: {}", command_id, err);
                continue;
            }
        };

        let status = invocation.status().cloned();
        let fallback = match status {
            Some(CommandInvocationStatus::Success) => 0,
            Some(CommandInvocationStatus::Cancelled)
            | Some(CommandInvocationStatus::Cancelling)
            | Some(CommandInvocationStatus::Failed)
            | Some(CommandInvocationStatus::TimedOut) => 1,
            Some(CommandInvocationStatus::Delayed)
            | Some(CommandInvocationStatus::InProgress)
            | Some(CommandInvocationStatus::Pending)
            | None => continue,
            Some(other) => {
                return Err(DeployError::Ssm {
                    dbg: format!("Unhandled status {:?} for {}", other, command_id),
                })
            }
        };

        let mut output = invocation
            .standard_output_content()
            .unwrap_or_default()
            .to_string();
        output.push_str(invocation.standard_error_content().unwrap_or_default());
        let exit_code = match exit_code(invocation.response_code()) {
            Some(code) if fallback == 0 || code != 0 => code,
            _ => fallback,
        };
        return Ok(RemoteOutput { exit_code, output });
    }
}
