use super::tag_value;
use crate::{
    error::{DeployError, DeployResult},
    fleet::Instance,
    pipeline::is_truthy,
    state::STATE,
};
use aws_sdk_ec2::types::Filter;
use tracing::debug;

pub fn filter(name: &str, values: &[String]) -> Filter {
    Filter::builder()
        .name(name)
        .set_values(Some(values.to_vec()))
        .build()
}

/// Live (pending or running) instances in the environment matching every
/// filter.
pub async fn describe_instances(
    ec2_client: &aws_sdk_ec2::Client,
    environment: &str,
    filters: Vec<Filter>,
) -> DeployResult<Vec<Instance>> {
    let mut filters = filters;
    filters.push(filter(
        &format!("tag:{}", STATE.environment_tag),
        &[environment.to_string()],
    ));
    filters.push(filter(
        "instance-state-name",
        &["pending".to_string(), "running".to_string()],
    ));

    let mut instances = Vec::new();
    let mut next_token = None;
    loop {
        let result = ec2_client
            .describe_instances()
            .set_filters(Some(filters.clone()))
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|err| DeployError::Ec2 {
                dbg: err.to_string(),
            })?;

        for reservation in result.reservations().unwrap_or_default() {
            for instance in reservation.instances().unwrap_or_default() {
                if let Some(instance) = to_instance(instance) {
                    instances.push(instance);
                }
            }
        }

        next_token = result.next_token().map(String::from);
        if next_token.is_none() {
            break;
        }
    }
    debug!("{} instances matched in {}", instances.len(), environment);
    Ok(instances)
}

pub async fn terminate_instances(
    ec2_client: &aws_sdk_ec2::Client,
    ids: Vec<String>,
) -> DeployResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    ec2_client
        .terminate_instances()
        .set_instance_ids(Some(ids))
        .send()
        .await
        .map_err(|err| DeployError::Ec2 {
            dbg: err.to_string(),
        })?;
    Ok(())
}

fn to_instance(instance: &aws_sdk_ec2::types::Instance) -> Option<Instance> {
    let tags = instance.tags();
    Some(Instance {
        id: instance.instance_id()?.to_string(),
        image_id: instance.image_id().unwrap_or_default().to_string(),
        hostclass: tag_value(tags, STATE.hostclass_tag).map(String::from),
        group_name: tag_value(tags, STATE.group_name_tag).map(String::from),
        private_ip: instance.private_ip_address().map(String::from),
        state: instance
            .state()
            .and_then(|state| state.name())
            .map(|name| name.as_str().to_string())
            .unwrap_or_default(),
        smoketested: tag_value(tags, STATE.smoketest_tag).map_or(false, is_truthy),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{InstanceState, InstanceStateName, Tag};

    #[test]
    fn converts_tagged_instance() {
        let raw = aws_sdk_ec2::types::Instance::builder()
            .instance_id("i-1")
            .image_id("ami-1")
            .private_ip_address("10.0.0.1")
            .state(InstanceState::builder().name(InstanceStateName::Running).build())
            .tags(Tag::builder().key("hostclass").value("mhcfoo").build())
            .tags(Tag::builder().key("smoketest").value("True").build())
            .tags(
                Tag::builder()
                    .key("aws:autoscaling:groupName")
                    .value("ci_mhcfoo_1")
                    .build(),
            )
            .build();

        let instance = to_instance(&raw).unwrap();
        assert_eq!(instance.id, "i-1");
        assert_eq!(instance.hostclass.as_deref(), Some("mhcfoo"));
        assert_eq!(instance.group_name.as_deref(), Some("ci_mhcfoo_1"));
        assert_eq!(instance.state, "running");
        assert!(instance.smoketested);
    }

    #[test]
    fn skips_instance_without_id() {
        let raw = aws_sdk_ec2::types::Instance::builder().image_id("ami-1").build();
        assert!(to_instance(&raw).is_none());
    }
}
