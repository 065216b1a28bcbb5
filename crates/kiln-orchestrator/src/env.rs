//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Container environment and local port assignment."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener};

use crate::service::ServiceSpec;

/// Host variables that would break or mislead a containerised service.
const CONFLICTING: &[&str] = &[
    "PATH", "HOME", "HOSTNAME", "PWD", "OLDPWD", "SHELL", "SHLVL", "TERM", "USER", "TMPDIR",
    "PORT", "_",
];

/// Prefix of variables owned by Kiln itself.
const RESERVED_PREFIX: &str = "KILN_";

fn conflicts(key: &str) -> bool {
    CONFLICTING.contains(&key) || key.starts_with(RESERVED_PREFIX) || key.contains('=')
}

/// Environment for one service container: the inherited variables minus
/// conflicting ones, then the service's configured values, then identity
/// values and the assigned port.
pub fn service_environment<I, K, V>(
    inherited: I,
    project: &str,
    spec: &ServiceSpec,
    port: u16,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env: BTreeMap<String, String> = inherited
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .filter(|(key, _)| !key.is_empty() && !conflicts(key))
        .collect();
    env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert("KILN_PROJECT".into(), project.to_owned());
    env.insert("KILN_SERVICE_NAME".into(), spec.name.clone());
    env.insert("KILN_ENVIRONMENT".into(), "run".into());
    env.insert("PORT".into(), port.to_string());
    env
}

/// Ask the OS for a currently free local TCP port.
pub fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_and_reserved_variables_are_replaced() {
        let mut spec = ServiceSpec::new("orders", "orders.ts", "/tmp").expect("spec");
        spec.env.insert("FEATURE_FLAG".into(), "on".into());
        let inherited = vec![
            ("PATH", "/usr/bin"),
            ("HOME", "/root"),
            ("PORT", "1"),
            ("KILN_SERVICE_NAME", "spoofed"),
            ("AWS_REGION", "eu-west-1"),
        ];
        let env = service_environment(inherited, "shop", &spec, 4321);
        assert!(!env.contains_key("PATH"));
        assert!(!env.contains_key("HOME"));
        assert_eq!(env.get("PORT").map(String::as_str), Some("4321"));
        assert_eq!(env.get("KILN_SERVICE_NAME").map(String::as_str), Some("orders"));
        assert_eq!(env.get("KILN_PROJECT").map(String::as_str), Some("shop"));
        assert_eq!(env.get("AWS_REGION").map(String::as_str), Some("eu-west-1"));
        assert_eq!(env.get("FEATURE_FLAG").map(String::as_str), Some("on"));
    }

    #[test]
    fn free_port_is_non_zero() {
        assert_ne!(free_port().expect("port"), 0);
    }
}
