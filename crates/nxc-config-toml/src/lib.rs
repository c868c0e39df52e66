// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-environment configuration for nxc, read from `<envdir>/nxc.toml`.
//!
//! Every section and every key is optional. A key that is absent leaves the
//! corresponding built-in default in place; consumers decide what that
//! default is.

use std::net::Ipv4Addr;
use std::path::Path;

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file inside an environment directory.
pub const CONFIG_FILE_NAME: &str = "nxc.toml";

/// Configuration for an nxc environment.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: Store,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub allocation: Allocation,

    #[serde(default)]
    pub kexec: Kexec,

    #[serde(default)]
    pub ssh: Ssh,
}

/// Where to look for store paths besides the local `/nix/store`.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Store {
    /// Alternative store roots, searched in order before the local store.
    #[serde(default, rename = "alternative-stores")]
    pub alternative_stores: Vec<Utf8PathBuf>,
}

/// Knobs for choosing between inline and served descriptor delivery.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Transport {
    /// Largest base64-encoded descriptor that may be passed inline.
    #[serde(rename = "inline-ceiling")]
    pub inline_ceiling: Option<usize>,

    /// Topologies with more nodes than this are always served.
    #[serde(rename = "small-topology-threshold")]
    pub small_topology_threshold: Option<usize>,

    /// Base URL of the content server used for served delivery.
    #[serde(rename = "served-root")]
    pub served_root: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// First address handed out by VM-local allocation.
    #[serde(rename = "vm-base-address")]
    pub vm_base_address: Option<Ipv4Addr>,

    /// First loopback address handed out in port-forwarding mode.
    #[serde(rename = "forward-base-address")]
    pub forward_base_address: Option<Ipv4Addr>,

    /// First forwarded SSH port.
    #[serde(rename = "forward-base-port")]
    pub forward_base_port: Option<u16>,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Kexec {
    /// Default privilege-escalation command baked into boot scripts.
    pub sudo: Option<String>,

    /// Console parameters appended to every kernel command line.
    pub console: Option<Vec<String>>,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Ssh {
    /// Public key handed to deployed nodes.
    #[serde(rename = "public-key")]
    pub public_key: Option<Utf8PathBuf>,
}

/// Errors which may be returned when parsing the environment configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

/// Parses the configuration at `path` if the file exists, and returns the
/// all-defaults configuration if it doesn't.
pub fn parse_or_default<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    match std::fs::read_to_string(path.as_ref()) {
        Ok(contents) => Ok(toml::from_str::<Config>(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config {
            store: Store {
                alternative_stores: vec!["/mnt/nix".into()],
            },
            ..Default::default()
        };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg: Config = toml::de::from_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert!(cfg.transport.inline_ceiling.is_none());
        assert!(cfg.store.alternative_stores.is_empty());
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
[store]
alternative-stores = ["/home/user/.nix", "/srv/nix"]

[transport]
inline-ceiling = 2048
small-topology-threshold = 8
served-root = "http://10.0.2.2:8080"

[allocation]
vm-base-address = "10.0.3.20"
forward-base-port = 23000

[kexec]
sudo = "doas"
console = ["console=ttyS1,9600"]

[ssh]
public-key = "/home/user/.ssh/id_ed25519.pub"
"#;
        let cfg: Config = toml::de::from_str(raw).unwrap();

        assert_eq!(cfg.store.alternative_stores.len(), 2);
        assert_eq!(cfg.store.alternative_stores[1], "/srv/nix");
        assert_eq!(cfg.transport.inline_ceiling, Some(2048));
        assert_eq!(cfg.transport.small_topology_threshold, Some(8));
        assert_eq!(
            cfg.transport.served_root.as_deref(),
            Some("http://10.0.2.2:8080")
        );
        assert_eq!(
            cfg.allocation.vm_base_address,
            Some(Ipv4Addr::new(10, 0, 3, 20))
        );
        assert!(cfg.allocation.forward_base_address.is_none());
        assert_eq!(cfg.allocation.forward_base_port, Some(23000));
        assert_eq!(cfg.kexec.sudo.as_deref(), Some("doas"));
        assert_eq!(
            cfg.kexec.console,
            Some(vec!["console=ttyS1,9600".to_string()])
        );
        assert_eq!(
            cfg.ssh.public_key.as_deref(),
            Some(camino::Utf8Path::new("/home/user/.ssh/id_ed25519.pub"))
        );
    }

    #[test]
    fn unknown_values_are_rejected() {
        let raw = r#"
[allocation]
forward-base-port = "not a port"
"#;
        assert!(toml::de::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = std::env::temp_dir().join("nxc-config-toml-missing");
        let cfg = parse_or_default(dir.join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
