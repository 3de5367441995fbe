use executor_core::config::HostAlias;
use executor_core::Image;
use k8s_openapi::api::core::v1::HostAlias as K8sHostAlias;
use thiserror::Error;

use crate::dns::validate_dns1123_label;

const SERVICES_IP: &str = "127.0.0.1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("provided host alias {alias:?} for service {service:?} is invalid DNS. {message}")]
pub struct InvalidHostAliasError {
    pub service: String,
    pub alias: String,
    pub message: String,
}

/// Alias derived from the image name: `group/postgres:13` gives `group-postgres`.
fn name_alias(name: &str) -> Option<String> {
    let without_digest = name.split('@').next().unwrap_or(name);
    let last_slash = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let without_tag = match without_digest[last_slash..].find(':') {
        Some(colon) => &without_digest[..last_slash + colon],
        None => without_digest,
    };
    let alias = without_tag.replace('/', "-");
    validate_dns1123_label(&alias).ok().map(|_| alias)
}

/// Host aliases for the pod: services reachable on localhost, then the configured ones.
///
/// Services exposing ports are reached through their own Service objects and get no alias.
pub fn host_aliases(
    services: &[Image],
    configured: &[HostAlias],
) -> Result<Option<Vec<K8sHostAlias>>, InvalidHostAliasError> {
    let mut hostnames: Vec<String> = Vec::new();

    for service in services.iter().filter(|s| s.ports.is_empty()) {
        if let Some(alias) = name_alias(&service.name) {
            hostnames.push(alias);
        }

        for alias in service.aliases() {
            validate_dns1123_label(alias).map_err(|message| InvalidHostAliasError {
                service: service.name.clone(),
                alias: alias.to_string(),
                message,
            })?;
            hostnames.push(alias.to_string());
        }
    }

    let mut aliases = Vec::new();
    if !hostnames.is_empty() {
        aliases.push(K8sHostAlias {
            ip: SERVICES_IP.to_string(),
            hostnames: Some(hostnames),
        });
    }

    aliases.extend(configured.iter().map(|a| K8sHostAlias {
        ip: a.ip.clone(),
        hostnames: Some(a.hostnames.clone()),
    }));

    Ok(Some(aliases).filter(|a| !a.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_core::Port;

    fn service(name: &str, alias: &str) -> Image {
        Image {
            alias: alias.to_string(),
            ..Image::new(name)
        }
    }

    fn hostnames(aliases: &[K8sHostAlias]) -> Vec<(String, Vec<String>)> {
        aliases
            .iter()
            .map(|a| (a.ip.clone(), a.hostnames.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn services_become_localhost_aliases() {
        let services = vec![
            service("test-service", "svc-alias svc-alias-alt"),
            service("docker:dind", ""),
        ];
        let aliases = host_aliases(&services, &[]).unwrap().unwrap();
        assert_eq!(
            hostnames(&aliases),
            vec![(
                "127.0.0.1".to_string(),
                vec![
                    "test-service".to_string(),
                    "svc-alias".to_string(),
                    "svc-alias-alt".to_string(),
                    "docker".to_string()
                ]
            )]
        );
    }

    #[test]
    fn services_with_ports_are_skipped() {
        let mut dind = service("docker:dind", "");
        dind.ports = vec![Port {
            number: 2375,
            protocol: "http".into(),
            name: String::new(),
        }];

        assert_eq!(host_aliases(&[dind.clone()], &[]).unwrap(), None);

        let configured = vec![HostAlias {
            ip: "8.8.8.8".into(),
            hostnames: vec!["dns1".into(), "dns2".into()],
        }];
        let aliases = host_aliases(&[service("test-service", "alias"), dind], &configured)
            .unwrap()
            .unwrap();
        assert_eq!(
            hostnames(&aliases),
            vec![
                (
                    "127.0.0.1".to_string(),
                    vec!["test-service".to_string(), "alias".to_string()]
                ),
                (
                    "8.8.8.8".to_string(),
                    vec!["dns1".to_string(), "dns2".to_string()]
                ),
            ]
        );
    }

    #[test]
    fn nothing_to_alias() {
        assert_eq!(host_aliases(&[], &[]).unwrap(), None);
    }

    #[test]
    fn registry_paths() {
        assert_eq!(
            name_alias("registry.example.com/group/postgres:13").as_deref(),
            None
        );
        assert_eq!(name_alias("group/postgres:13").as_deref(), Some("group-postgres"));
        assert_eq!(name_alias("localhost:5000/redis"), None);
        assert_eq!(name_alias("postgres@sha256:abc").as_deref(), Some("postgres"));
    }

    #[test]
    fn invalid_explicit_alias_fails() {
        let err = host_aliases(
            &[service("test-service", "INVALID_ALIAS"), service("docker:dind", "")],
            &[],
        )
        .unwrap_err();
        assert_eq!(err.alias, "INVALID_ALIAS");
    }
}
