use core::time::Duration;

pub const STATE: State = State {
    version: "v1.0.0",
    region: "us-west-2",
    default_config_section: "disco_aws",
    bake_config_section: "bake",
    test_config_section: "test",
    default_ami_stages: &["untested", "failed", "tested"],

    // polling
    autoscale_poll_interval: Duration::from_secs(15),
    autoscale_timeout: Duration::from_secs(300),
    smoketest_poll_interval: Duration::from_secs(15),
    smoketest_timeout: Duration::from_secs(600),
    elb_poll_interval: Duration::from_secs(10),
    elb_timeout: Duration::from_secs(300),
    ssm_poll_interval: Duration::from_secs(5),
    ssm_timeout: Duration::from_secs(1800),

    // remote scripts
    maintenance_mode_script: "/opt/wgen/bin/maintenance-mode.sh",
    testing_mode_script: "/opt/wgen/bin/testing-mode.sh",

    // tags
    stage_tag: "stage",
    baker_tag: "baker",
    hostclass_tag: "hostclass",
    environment_tag: "environment",
    smoketest_tag: "smoketest",
    testing_tag: "testing",
    group_name_tag: "aws:autoscaling:groupName",

    default_instance_type: "m3.large",
    elb_port: 80,
};

pub struct State {
    pub version: &'static str,
    pub region: &'static str,
    pub default_config_section: &'static str,
    pub bake_config_section: &'static str,
    pub test_config_section: &'static str,
    pub default_ami_stages: &'static [&'static str],

    pub autoscale_poll_interval: Duration,
    pub autoscale_timeout: Duration,
    pub smoketest_poll_interval: Duration,
    pub smoketest_timeout: Duration,
    pub elb_poll_interval: Duration,
    pub elb_timeout: Duration,
    pub ssm_poll_interval: Duration,
    pub ssm_timeout: Duration,

    pub maintenance_mode_script: &'static str,
    pub testing_mode_script: &'static str,

    pub stage_tag: &'static str,
    pub baker_tag: &'static str,
    pub hostclass_tag: &'static str,
    pub environment_tag: &'static str,
    pub smoketest_tag: &'static str,
    pub testing_tag: &'static str,
    pub group_name_tag: &'static str,

    pub default_instance_type: &'static str,
    pub elb_port: i32,
}

impl State {
    // Classic ELB names are limited to 32 characters.
    pub fn elb_name(&self, environment: &str, hostclass: &str, testing: bool) -> String {
        let suffix = if testing { "-test" } else { "" };
        let mut name = format!("{}-{}{}", environment, hostclass, suffix);
        name.truncate(32);
        name
    }
}
