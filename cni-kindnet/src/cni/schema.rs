//! Representation of the JSON wire format used by CNI. See the [CNI
//! Specification](https://github.com/containernetworking/cni/blob/master/SPEC.md).
//!
//! `cni-kindnet` is never invoked as part of a plugin chain or list (CNI
//! chaining is a non-goal), so unlike a general-purpose CNI client this
//! module only needs the plugin's own network configuration object, not the
//! generic `NetworkConfigurationList`/`PluginConfiguration` machinery a
//! delegating client would use.

use std::collections::HashMap;
use std::fmt;

use serde::{de, Deserialize, Serialize};
use serde_json::Value;

/// Network configuration passed to this plugin on stdin.
///
/// [Specification](https://github.com/containernetworking/cni/blob/master/SPEC.md#network-configuration).
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct NetConf {
    /// Semantic Version 2.0 of the CNI specification this object conforms to.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    /// Network name. Should be unique across all containers on the host.
    pub name: String,

    /// Refers to the filename of the CNI plugin executable. Always
    /// `"cni-kindnet"` for configuration this plugin accepts.
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Allocatable CIDRs. At most one IPv4 and one IPv6 prefix.
    #[serde(default)]
    pub ranges: Vec<String>,

    /// Pod interface MTU. `None`/`0` means "inherit the host default
    /// route's MTU".
    #[serde(default)]
    pub mtu: Option<u32>,

    /// Additional arguments supplied by the container runtime, including
    /// `portMappings`.
    #[serde(rename = "runtimeConfig")]
    #[serde(default)]
    pub runtime_config: RuntimeConfig,

    /// Fields this plugin does not recognize. Preserved rather than
    /// rejected, per the CNI spec's tolerance for unknown top-level fields.
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(rename = "portMappings")]
    #[serde(default)]
    pub port_mappings: Vec<PortMappingConf>,
}

/// One `hostPort -> containerPort` mapping requested via `runtimeConfig`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortMappingConf {
    #[serde(rename = "hostPort")]
    pub host_port: u16,

    #[serde(rename = "containerPort")]
    pub container_port: u16,

    pub protocol: Protocol,

    #[serde(rename = "hostIP")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

/// Transport protocol for a port mapping.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Sctp => f.write_str("sctp"),
        }
    }
}

/// Result of a successful `ADD`, in CNI 0.4.0 result-object shape.
///
/// [Result specification](https://github.com/containernetworking/cni/blob/master/SPEC.md#result).
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SuccessResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    pub interfaces: Vec<InterfaceResult>,

    pub ips: Vec<IpResult>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteResult>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfiguration>,
}

/// A network interface reported in a CNI result.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct InterfaceResult {
    pub name: String,
}

/// One assigned IP address, reported in a CNI result.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IpResult {
    pub version: IpVersion,

    /// `address/32` or `address/128`.
    pub address: String,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into `SuccessResult::interfaces` this IP applies to.
    pub interface: usize,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "6")]
    V6,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct RouteResult {
    #[serde(rename = "dst")]
    pub destination: String,

    #[serde(rename = "gw")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Common DNS information, forwarded verbatim if the config carried any.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsConfiguration {
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// A CNI plugin error object, written to stderr on failure.
///
/// [Well-known error codes](https://github.com/containernetworking/cni/blob/master/SPEC.md#well-known-error-codes).
#[derive(Debug, Serialize)]
pub struct ErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    pub code: ErrorCode,

    #[serde(rename = "msg")]
    pub message: String,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A CNI error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    IncompatibleCniVersion,
    UnsupportedConfigurationField,
    ContainerUnknown,
    InvalidEnvironmentVariable,
    Io,
    Decode,
    InvalidNetworkConfiguration,
    Transient,
    Reserved(u32),
    Plugin(u32),
}

impl ErrorCode {
    fn numeric(self) -> u32 {
        match self {
            ErrorCode::IncompatibleCniVersion => 1,
            ErrorCode::UnsupportedConfigurationField => 2,
            ErrorCode::ContainerUnknown => 3,
            ErrorCode::InvalidEnvironmentVariable => 4,
            ErrorCode::Io => 5,
            ErrorCode::Decode => 6,
            ErrorCode::InvalidNetworkConfiguration => 7,
            ErrorCode::Transient => 11,
            ErrorCode::Reserved(code) => code,
            ErrorCode::Plugin(code) => 100 + code,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.numeric())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<ErrorCode, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct ErrorCodeVisitor;

        impl<'de> de::Visitor<'de> for ErrorCodeVisitor {
            type Value = ErrorCode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a CNI error code")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                Ok(match value as u32 {
                    1 => ErrorCode::IncompatibleCniVersion,
                    2 => ErrorCode::UnsupportedConfigurationField,
                    3 => ErrorCode::ContainerUnknown,
                    4 => ErrorCode::InvalidEnvironmentVariable,
                    5 => ErrorCode::Io,
                    6 => ErrorCode::Decode,
                    7 => ErrorCode::InvalidNetworkConfiguration,
                    11 => ErrorCode::Transient,
                    n @ (8 | 9 | 12..=99) => ErrorCode::Reserved(n),
                    n => ErrorCode::Plugin(n.saturating_sub(100)),
                })
            }
        }

        deserializer.deserialize_u32(ErrorCodeVisitor)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCode::IncompatibleCniVersion => f.write_str("Incompatible CNI version"),
            ErrorCode::UnsupportedConfigurationField => {
                f.write_str("Unsupported field in network configuration")
            }
            ErrorCode::ContainerUnknown => f.write_str("Container unknown or does not exist"),
            ErrorCode::InvalidEnvironmentVariable => {
                f.write_str("Invalid necessary environment variables")
            }
            ErrorCode::Io => f.write_str("I/O failure"),
            ErrorCode::Decode => f.write_str("Failed to decode content"),
            ErrorCode::InvalidNetworkConfiguration => f.write_str("Invalid network config"),
            ErrorCode::Transient => f.write_str("Try again later"),
            ErrorCode::Reserved(code) => write!(f, "reserved error {}", code),
            ErrorCode::Plugin(code) => write!(f, "plugin-specific error {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_netconf() {
        let json = json!({
            "cniVersion": "0.4.0",
            "name": "kindnet",
            "type": "cni-kindnet",
            "ranges": ["10.244.0.0/24", "fd00:10:244::/64"],
        });
        let conf: NetConf = serde_json::from_value(json).unwrap();
        assert_eq!(conf.ranges, vec!["10.244.0.0/24", "fd00:10:244::/64"]);
        assert_eq!(conf.mtu, None);
        assert!(conf.runtime_config.port_mappings.is_empty());
    }

    #[test]
    fn parses_port_mappings() {
        let json = json!({
            "cniVersion": "0.4.0",
            "name": "kindnet",
            "type": "cni-kindnet",
            "ranges": ["10.244.0.0/24"],
            "mtu": 1500,
            "runtimeConfig": {
                "portMappings": [
                    {"hostPort": 18090, "containerPort": 8080, "protocol": "tcp", "hostIP": "127.0.0.1"}
                ]
            }
        });
        let conf: NetConf = serde_json::from_value(json).unwrap();
        assert_eq!(conf.mtu, Some(1500));
        let pm = &conf.runtime_config.port_mappings[0];
        assert_eq!(pm.host_port, 18090);
        assert_eq!(pm.container_port, 8080);
        assert_eq!(pm.protocol, Protocol::Tcp);
        assert_eq!(pm.host_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn error_code_roundtrips_through_plugin_range() {
        let json = json!(101);
        let code: ErrorCode = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(code, ErrorCode::Plugin(1));
        assert_eq!(serde_json::to_value(code).unwrap(), json);
    }

    #[test]
    fn success_result_orders_ipv4_before_ipv6() {
        let result = SuccessResult {
            cni_version: "0.4.0".into(),
            interfaces: vec![InterfaceResult { name: "eth0".into() }],
            ips: vec![
                IpResult {
                    version: IpVersion::V4,
                    address: "10.244.0.5/32".into(),
                    gateway: Some("10.244.0.1".into()),
                    interface: 0,
                },
                IpResult {
                    version: IpVersion::V6,
                    address: "fd00:10:244::5/128".into(),
                    gateway: Some("fd00:10:244::1".into()),
                    interface: 0,
                },
            ],
            routes: Vec::new(),
            dns: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["ips"][0]["version"], "4");
        assert_eq!(value["ips"][1]["version"], "6");
    }
}
