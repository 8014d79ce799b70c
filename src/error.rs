pub type DeployResult<T, E = DeployError> = Result<T, E>;

#[derive(Debug)]
pub enum DeployError {
    Config { dbg: String },
    Pipeline { dbg: String },
    Ec2 { dbg: String },
    Ssm { dbg: String },
    Autoscale { dbg: String },
    Elb { dbg: String },

    // Errors below terminate the run. They point at configuration or
    // environment corruption rather than a transient AWS condition.
    UnknownStrategy { dbg: String },
    PreTest { dbg: String },
    GroupCollision { dbg: String },
}

impl DeployError {
    pub fn is_hard_rollout_error(&self) -> bool {
        matches!(
            self,
            DeployError::UnknownStrategy { .. }
                | DeployError::PreTest { .. }
                | DeployError::GroupCollision { .. }
        )
    }
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployError::Config { dbg } => write!(f, "{}", dbg),
            DeployError::Pipeline { dbg } => write!(f, "{}", dbg),
            DeployError::Ec2 { dbg } => write!(f, "{}", dbg),
            DeployError::Ssm { dbg } => write!(f, "{}", dbg),
            DeployError::Autoscale { dbg } => write!(f, "{}", dbg),
            DeployError::Elb { dbg } => write!(f, "{}", dbg),
            DeployError::UnknownStrategy { dbg } => write!(f, "{}", dbg),
            DeployError::PreTest { dbg } => write!(f, "{}", dbg),
            DeployError::GroupCollision { dbg } => write!(f, "{}", dbg),
        }
    }
}

impl std::error::Error for DeployError {}
