//! Stdin configuration parsing and store location resolution.

use std::io::Read;
use std::path::PathBuf;

use crate::cni::schema::NetConf;
use crate::error::Error;

/// Resolves where `cni.db` lives on this node. Defaults to
/// `/var/lib/cni-kindnet/`, overridable for tests and non-standard
/// installs via `CNI_KINDNET_DB_DIR`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl StoreConfig {
    pub fn from_env() -> StoreConfig {
        let dir = std::env::var("CNI_KINDNET_DB_DIR")
            .unwrap_or_else(|_| "/var/lib/cni-kindnet".to_string());
        StoreConfig {
            db_path: PathBuf::from(dir).join("cni.db"),
        }
    }
}

/// Read all of stdin and parse it as a [`NetConf`].
pub fn read_netconf<R: Read>(mut reader: R) -> Result<NetConf, Error> {
    let mut buf = String::new();
    reader
        .read_to_string(&mut buf)
        .map_err(|error| Error::Io {
            context: "reading stdin network configuration".into(),
            error,
        })?;
    serde_json::from_str(&buf).map_err(|err| Error::Config(format!("invalid stdin JSON: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_json() {
        let err = read_netconf("{not json".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn parses_well_formed_config() {
        let input = r#"{
            "cniVersion": "0.4.0",
            "name": "kindnet",
            "type": "cni-kindnet",
            "ranges": ["10.244.0.0/24"]
        }"#;
        let conf = read_netconf(input.as_bytes()).unwrap();
        assert_eq!(conf.name, "kindnet");
        assert_eq!(conf.ranges, vec!["10.244.0.0/24"]);
    }
}
