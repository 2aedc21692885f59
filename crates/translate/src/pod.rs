//! Pod template spec subset used by workload kinds.

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodSpec};
use kform_core::schema::{DefaultValue, Field, Presence};
use kform_core::tree::{
    blocks, bool_field, int_field, put_blocks, put_bool, put_int, put_list, put_map, put_str, str_field, string_list,
    string_map, Fields,
};
use kform_core::{Error, Result};

use crate::{int32, non_empty};

const PORT_FIELDS: &[Field] = &[
    Field::int("container_port", Presence::Required),
    Field::string("name", Presence::Optional),
    Field::string("protocol", Presence::OptionalComputed),
    Field::int("host_port", Presence::Optional),
];

const ENV_FIELDS: &[Field] = &[Field::string("name", Presence::Required), Field::string("value", Presence::Optional)];

pub const CONTAINER_FIELDS: &[Field] = &[
    Field::string("name", Presence::Required),
    Field::string("image", Presence::Optional),
    Field::list("command", Presence::Optional),
    Field::list("args", Presence::Optional),
    Field::string("working_dir", Presence::Optional),
    Field::string("image_pull_policy", Presence::OptionalComputed),
    Field::repeated("port", PORT_FIELDS, Presence::Optional),
    Field::repeated("env", ENV_FIELDS, Presence::Optional),
];

pub const FIELDS: &[Field] = &[
    Field::int("active_deadline_seconds", Presence::Optional),
    Field::repeated("container", CONTAINER_FIELDS, Presence::Optional),
    Field::repeated("init_container", CONTAINER_FIELDS, Presence::Optional),
    Field::string("dns_policy", Presence::OptionalComputed),
    Field::bool("host_ipc", Presence::Optional).with_default(DefaultValue::Bool(false)),
    Field::bool("host_network", Presence::Optional).with_default(DefaultValue::Bool(false)),
    Field::bool("host_pid", Presence::Optional).with_default(DefaultValue::Bool(false)),
    Field::string("hostname", Presence::Optional),
    Field::string("node_name", Presence::Optional),
    Field::map("node_selector", Presence::Optional),
    Field::string("restart_policy", Presence::OptionalComputed),
    Field::string("service_account_name", Presence::OptionalComputed),
    Field::int("termination_grace_period_seconds", Presence::OptionalComputed),
];

pub fn expand(fields: &Fields) -> Result<PodSpec> {
    let node_selector = string_map(fields, "node_selector");
    Ok(PodSpec {
        active_deadline_seconds: int_field(fields, "active_deadline_seconds"),
        containers: expand_containers(fields, "container")?,
        init_containers: non_empty(expand_containers(fields, "init_container")?),
        dns_policy: str_field(fields, "dns_policy").map(String::from),
        host_ipc: Some(bool_field(fields, "host_ipc").unwrap_or(false)),
        host_network: Some(bool_field(fields, "host_network").unwrap_or(false)),
        host_pid: Some(bool_field(fields, "host_pid").unwrap_or(false)),
        hostname: str_field(fields, "hostname").map(String::from),
        node_name: str_field(fields, "node_name").map(String::from),
        node_selector: (!node_selector.is_empty()).then_some(node_selector),
        restart_policy: str_field(fields, "restart_policy").map(String::from),
        service_account_name: str_field(fields, "service_account_name").map(String::from),
        termination_grace_period_seconds: int_field(fields, "termination_grace_period_seconds"),
        ..PodSpec::default()
    })
}

fn expand_containers(fields: &Fields, key: &str) -> Result<Vec<Container>> {
    blocks(fields, key).enumerate().map(|(i, c)| expand_container(c, &format!("{}.{}", key, i))).collect()
}

fn expand_container(fields: &Fields, path: &str) -> Result<Container> {
    let name = str_field(fields, "name").ok_or_else(|| Error::invalid_shape(format!("{}: name is required", path)))?;
    let ports = blocks(fields, "port")
        .enumerate()
        .map(|(i, p)| {
            let port_path = format!("{}.port.{}", path, i);
            let container_port = int_field(p, "container_port")
                .ok_or_else(|| Error::invalid_shape(format!("{}: container_port is required", port_path)))?;
            Ok(ContainerPort {
                container_port: int32(container_port, &port_path)?,
                name: str_field(p, "name").map(String::from),
                protocol: str_field(p, "protocol").map(String::from),
                host_port: int_field(p, "host_port").map(|v| int32(v, &port_path)).transpose()?,
                ..ContainerPort::default()
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let env = blocks(fields, "env")
        .enumerate()
        .map(|(i, e)| {
            let name = str_field(e, "name")
                .ok_or_else(|| Error::invalid_shape(format!("{}.env.{}: name is required", path, i)))?;
            Ok(EnvVar { name: name.to_string(), value: str_field(e, "value").map(String::from), ..EnvVar::default() })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Container {
        name: name.to_string(),
        image: str_field(fields, "image").map(String::from),
        command: non_empty(string_list(fields, "command")),
        args: non_empty(string_list(fields, "args")),
        working_dir: str_field(fields, "working_dir").map(String::from),
        image_pull_policy: str_field(fields, "image_pull_policy").map(String::from),
        ports: non_empty(ports),
        env: non_empty(env),
        ..Container::default()
    })
}

pub fn flatten(spec: &PodSpec) -> Fields {
    let mut out = Fields::new();
    put_int(&mut out, "active_deadline_seconds", spec.active_deadline_seconds);
    put_blocks(&mut out, "container", spec.containers.iter().map(flatten_container).collect());
    put_blocks(
        &mut out,
        "init_container",
        spec.init_containers.iter().flatten().map(flatten_container).collect(),
    );
    put_str(&mut out, "dns_policy", spec.dns_policy.as_deref());
    put_bool(&mut out, "host_ipc", Some(spec.host_ipc.unwrap_or(false)));
    put_bool(&mut out, "host_network", Some(spec.host_network.unwrap_or(false)));
    put_bool(&mut out, "host_pid", Some(spec.host_pid.unwrap_or(false)));
    put_str(&mut out, "hostname", spec.hostname.as_deref());
    put_str(&mut out, "node_name", spec.node_name.as_deref());
    put_map(&mut out, "node_selector", &spec.node_selector.clone().unwrap_or_default());
    put_str(&mut out, "restart_policy", spec.restart_policy.as_deref());
    put_str(&mut out, "service_account_name", spec.service_account_name.as_deref());
    put_int(&mut out, "termination_grace_period_seconds", spec.termination_grace_period_seconds);
    out
}

fn flatten_container(c: &Container) -> Fields {
    let mut out = Fields::new();
    put_str(&mut out, "name", Some(&c.name));
    put_str(&mut out, "image", c.image.as_deref());
    put_list(&mut out, "command", c.command.as_deref().unwrap_or_default());
    put_list(&mut out, "args", c.args.as_deref().unwrap_or_default());
    put_str(&mut out, "working_dir", c.working_dir.as_deref());
    put_str(&mut out, "image_pull_policy", c.image_pull_policy.as_deref());
    let ports = c
        .ports
        .iter()
        .flatten()
        .map(|p| {
            let mut f = Fields::new();
            put_int(&mut f, "container_port", Some(i64::from(p.container_port)));
            put_str(&mut f, "name", p.name.as_deref());
            put_str(&mut f, "protocol", p.protocol.as_deref());
            put_int(&mut f, "host_port", p.host_port.map(i64::from));
            f
        })
        .collect();
    put_blocks(&mut out, "port", ports);
    let env = c
        .env
        .iter()
        .flatten()
        .map(|e| {
            let mut f = Fields::new();
            put_str(&mut f, "name", Some(&e.name));
            put_str(&mut f, "value", e.value.as_deref());
            f
        })
        .collect();
    put_blocks(&mut out, "env", env);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn expand_applies_host_defaults_and_keeps_order() {
        let spec = expand(&fields(json!({
            "container": [{ "name": "app", "image": "nginx:1.25", "args": ["--b", "--a"] }]
        })))
        .unwrap();
        assert_eq!(spec.host_network, Some(false));
        assert_eq!(spec.containers[0].args.as_deref(), Some(&["--b".to_string(), "--a".to_string()][..]));
        assert!(spec.init_containers.is_none());
    }

    #[test]
    fn container_without_name_is_invalid() {
        let err = expand(&fields(json!({ "container": [{ "image": "nginx" }] }))).unwrap_err();
        assert!(matches!(err, Error::InvalidShape(ref m) if m.contains("container.0")));
    }

    #[test]
    fn port_out_of_range_is_invalid() {
        let err = expand(&fields(json!({
            "container": [{ "name": "a", "port": [{ "container_port": 4_294_967_296i64 }] }]
        })))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));
    }

    #[test]
    fn flatten_surfaces_server_defaults() {
        let spec = PodSpec {
            containers: vec![Container {
                name: "app".into(),
                image_pull_policy: Some("IfNotPresent".into()),
                ..Container::default()
            }],
            dns_policy: Some("ClusterFirst".into()),
            restart_policy: Some("Always".into()),
            ..PodSpec::default()
        };
        let out = flatten(&spec);
        assert_eq!(out["dns_policy"], "ClusterFirst");
        assert_eq!(out["host_pid"], false);
        assert_eq!(out["container"][0]["image_pull_policy"], "IfNotPresent");
        assert!(out.get("init_container").is_none());
    }
}
