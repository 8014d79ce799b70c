// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Result of a bounded wait or a test run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    // The candidate is bad: timeout, smoke test error, non-zero test exit.
    Failed { reason: String },
    // The attempt couldn't be carried out: no test host, maintenance mode
    // couldn't be toggled. The candidate stays untagged.
    Aborted { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Outcome::Aborted {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Failed { reason } => write!(f, "failed: {}", reason),
            Outcome::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

/// Result of a whole test or update run for one candidate AMI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeployOutcome {
    DryRun,
    NothingToDo,
    // Candidate is serving production traffic.
    Deployed,
    // Candidate passed and was tagged, but production was left alone.
    Tested,
    // Candidate passed testing but the cutover couldn't be completed.
    NotPromoted { reason: String },
    Failed,
    Aborted { reason: String },
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeployOutcome::DryRun
                | DeployOutcome::NothingToDo
                | DeployOutcome::Deployed
                | DeployOutcome::Tested
        )
    }
}

impl std::fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployOutcome::DryRun => write!(f, "dry run"),
            DeployOutcome::NothingToDo => write!(f, "nothing to do"),
            DeployOutcome::Deployed => write!(f, "deployed"),
            DeployOutcome::Tested => write!(f, "tested"),
            DeployOutcome::NotPromoted { reason } => write!(f, "not promoted: {}", reason),
            DeployOutcome::Failed => write!(f, "failed"),
            DeployOutcome::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}
