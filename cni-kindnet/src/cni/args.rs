//! Parsing of the environment variables the container runtime sets before
//! invoking the plugin, per the CNI process contract.

use std::collections::HashMap;
use std::env;

use crate::error::Error;

/// The CNI command this invocation is performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
}

/// Environment the runtime provides for a single plugin invocation.
#[derive(Debug)]
pub struct CniArgs {
    pub command: Command,
    pub container_id: String,
    /// Path to the pod's network namespace. Empty on some `DEL` calls,
    /// which is treated as an already-idempotent success.
    pub netns: String,
    pub ifname: String,
    /// Parsed `CNI_ARGS` (`;`-separated `KEY=VALUE` pairs).
    pub extra: HashMap<String, String>,
}

impl CniArgs {
    /// Read `CniArgs` from the process environment.
    pub fn from_env() -> Result<CniArgs, Error> {
        let command = match read_var("CNI_COMMAND")?.as_str() {
            "ADD" => Command::Add,
            "DEL" => Command::Del,
            "CHECK" => Command::Check,
            other => {
                return Err(Error::Config(format!(
                    "unrecognized CNI_COMMAND {:?}",
                    other
                )))
            }
        };

        let container_id = read_var("CNI_CONTAINERID")?;
        let ifname = read_var("CNI_IFNAME").unwrap_or_else(|_| "eth0".to_string());
        let netns = env::var("CNI_NETNS").unwrap_or_default();
        let extra = parse_cni_args(&env::var("CNI_ARGS").unwrap_or_default());

        Ok(CniArgs {
            command,
            container_id,
            netns,
            ifname,
            extra,
        })
    }

    /// `K8S_POD_NAME` from `CNI_ARGS`, or empty string if absent.
    pub fn pod_name(&self) -> String {
        self.extra.get("K8S_POD_NAME").cloned().unwrap_or_default()
    }

    /// `K8S_POD_NAMESPACE` from `CNI_ARGS`, or empty string if absent.
    pub fn pod_namespace(&self) -> String {
        self.extra
            .get("K8S_POD_NAMESPACE")
            .cloned()
            .unwrap_or_default()
    }

    /// `K8S_POD_UID` / `K8S_POD_INFRA_CONTAINER_ID` from `CNI_ARGS`, or
    /// empty string if absent.
    pub fn pod_uid(&self) -> String {
        self.extra
            .get("K8S_POD_UID")
            .or_else(|| self.extra.get("K8S_POD_INFRA_CONTAINER_ID"))
            .cloned()
            .unwrap_or_default()
    }
}

fn read_var(name: &str) -> Result<String, Error> {
    env::var(name).map_err(|_| Error::Config(format!("missing environment variable {}", name)))
}

/// Parse the `;`-separated `KEY=VALUE` form of `CNI_ARGS`.
fn parse_cni_args(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_k8s_args() {
        let parsed = parse_cni_args(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx;K8S_POD_INFRA_CONTAINER_ID=abc123",
        );
        assert_eq!(parsed.get("K8S_POD_NAMESPACE").unwrap(), "default");
        assert_eq!(parsed.get("K8S_POD_NAME").unwrap(), "nginx");
        assert_eq!(
            parsed.get("K8S_POD_INFRA_CONTAINER_ID").unwrap(),
            "abc123"
        );
    }

    #[test]
    fn empty_args_parse_to_empty_map() {
        assert!(parse_cni_args("").is_empty());
    }
}
