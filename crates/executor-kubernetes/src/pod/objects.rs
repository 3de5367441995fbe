//! Objects created next to the build pod: registry credentials, scripts and proxy services.

use std::collections::BTreeMap;

use executor_core::{Credentials, Port};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde::Serialize;

use crate::dns::{generate_name, make_dns1123_compatible};
use crate::shell::{detect_shell_script, stage_script, ScriptLayout, Shell, DETECT_SHELL_SCRIPT_NAME};

pub const DOCKERCFG_SECRET_TYPE: &str = "kubernetes.io/dockercfg";
pub const DOCKERCFG_KEY: &str = ".dockercfg";

#[derive(Serialize)]
struct AuthEntry<'a> {
    username: &'a str,
    password: &'a str,
}

fn meta(name: String, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Registry credentials as a dockercfg secret. `None` when the job carries none.
pub fn credentials_secret<'a>(
    prefix: &str,
    namespace: &str,
    credentials: impl IntoIterator<Item = &'a Credentials>,
) -> Result<Option<Secret>, serde_json::Error> {
    let auths: BTreeMap<&str, AuthEntry<'_>> = credentials
        .into_iter()
        .map(|c| {
            (
                c.url.as_str(),
                AuthEntry {
                    username: &c.username,
                    password: &c.password,
                },
            )
        })
        .collect();

    if auths.is_empty() {
        return Ok(None);
    }

    let content = serde_json::to_vec(&auths)?;
    let mut data = BTreeMap::new();
    data.insert(DOCKERCFG_KEY.to_string(), ByteString(content));

    Ok(Some(Secret {
        metadata: meta(generate_name(prefix), namespace),
        type_: Some(DOCKERCFG_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    }))
}

/// Configmap holding the detect-shell script and one wrapped script per stage.
pub fn scripts_config_map<'a>(
    prefix: &str,
    namespace: &str,
    shell: Shell,
    layout: &ScriptLayout,
    stages: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(DETECT_SHELL_SCRIPT_NAME.to_string(), detect_shell_script());

    for (stage, body) in stages {
        data.insert(
            ScriptLayout::stage_key(stage),
            stage_script(shell, &layout.stage_path(stage), body),
        );
    }

    ConfigMap {
        metadata: meta(generate_name(&format!("{}-scripts", prefix)), namespace),
        data: Some(data),
        ..Default::default()
    }
}

/// ClusterIP service exposing a container's ports, selected by the pod's identifying labels.
pub fn proxy_service(
    name: &str,
    namespace: &str,
    ports: &[Port],
    selector: &BTreeMap<String, String>,
) -> Service {
    let service_name = make_dns1123_compatible(name);
    let ports = ports
        .iter()
        .map(|port| ServicePort {
            name: Some(format!("{}-{}", service_name, port.number)),
            port: port.number,
            target_port: Some(IntOrString::Int(port.number)),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: meta(generate_name(&service_name), namespace),
        spec: Some(ServiceSpec {
            ports: Some(ports),
            selector: Some(selector.clone()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
