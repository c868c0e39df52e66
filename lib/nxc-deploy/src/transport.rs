// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! How a booting node receives its deployment descriptor: embedded in the
//! kernel command line, or fetched from a content server.

use std::fmt;

use base64::Engine;
use thiserror::Error;
use tracing::{debug, info};

use crate::descriptor::{
    BuiltDescriptor, DescriptorError, TrimmedDescriptor,
    SMALL_TOPOLOGY_THRESHOLD,
};
use crate::layout::EnvLayout;

/// Maximum length of the kernel command line.
pub const KERNEL_PARAM_LIMIT: usize = 4096;

/// Room left on the command line for everything besides the descriptor.
pub const RESERVED_PARAM_BYTES: usize = 256;

/// Largest encoded descriptor that may be passed inline.
pub const INLINE_CEILING: usize = KERNEL_PARAM_LIMIT - RESERVED_PARAM_BYTES;

/// Where nodes fetch served descriptors from when nothing else is
/// configured. QEMU's user-mode network exposes the host as `10.0.2.2`.
pub const DEFAULT_SERVED_ROOT: &str = "http://10.0.2.2:8000";

/// The kernel parameter carrying the descriptor or its location.
pub const DEPLOY_PARAM: &str = "deploy";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no deploy= parameter on the command line")]
    MissingParam,

    #[error("deploy= points at {0}, which is served rather than inline")]
    Served(String),

    #[error("inline descriptor is not valid base64")]
    Base64(#[from] base64::DecodeError),

    #[error("inline descriptor is not a valid trimmed descriptor")]
    Json(#[from] serde_json::Error),
}

/// Why a descriptor is served rather than passed inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServedReason {
    /// The topology has more nodes than the small-topology threshold.
    LargeTopology { nodes: usize },

    /// The encoded descriptor is longer than the inline ceiling.
    OverCeiling { encoded_len: usize, ceiling: usize },
}

impl fmt::Display for ServedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LargeTopology { nodes } => {
                write!(f, "topology has {nodes} nodes")
            }
            Self::OverCeiling { encoded_len, ceiling } => write!(
                f,
                "encoded descriptor is {encoded_len} bytes, over the \
                 {ceiling} byte limit"
            ),
        }
    }
}

/// The outcome of transport selection for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportDecision {
    /// The base64-encoded trimmed descriptor, passed as-is.
    Inline { encoded: String },

    /// The URL nodes fetch the full descriptor from.
    Served { url: String, reason: ServedReason },
}

impl TransportDecision {
    /// The value of the `deploy=` kernel parameter.
    pub fn deploy_value(&self) -> &str {
        match self {
            Self::Inline { encoded } => encoded,
            Self::Served { url, .. } => url,
        }
    }

    pub fn deploy_param(&self) -> String {
        format!("{DEPLOY_PARAM}={}", self.deploy_value())
    }

    /// True if a content server must be serving the environment directory
    /// for nodes to boot.
    pub fn requires_content_server(&self) -> bool {
        matches!(self, Self::Served { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportPolicy {
    pub inline_ceiling: usize,
    pub small_topology_threshold: usize,
    pub served_root: String,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            inline_ceiling: INLINE_CEILING,
            small_topology_threshold: SMALL_TOPOLOGY_THRESHOLD,
            served_root: DEFAULT_SERVED_ROOT.to_owned(),
        }
    }
}

impl TransportPolicy {
    pub fn from_config(config: &nxc_config_toml::Transport) -> Self {
        let default = Self::default();
        Self {
            inline_ceiling: config
                .inline_ceiling
                .unwrap_or(default.inline_ceiling),
            small_topology_threshold: config
                .small_topology_threshold
                .unwrap_or(default.small_topology_threshold),
            served_root: config
                .served_root
                .clone()
                .unwrap_or(default.served_root),
        }
    }

    pub fn fits_inline(&self, encoded_len: usize) -> bool {
        encoded_len <= self.inline_ceiling
    }

    /// Where the descriptor for `layout` is served from.
    pub fn served_url(&self, layout: &EnvLayout) -> String {
        format!(
            "{}/{}",
            self.served_root.trim_end_matches('/'),
            layout.deployment_file_relative()
        )
    }

    /// Chooses how `built` reaches the nodes. The same descriptor always
    /// yields the same decision.
    pub fn select(
        &self,
        built: &BuiltDescriptor,
        layout: &EnvLayout,
    ) -> Result<TransportDecision, DescriptorError> {
        let encoded = encode_inline(&built.descriptor.trimmed())?;
        debug!(encoded_len = encoded.len(), "encoded trimmed descriptor");

        let reason = if built.exceeds_small_topology {
            Some(ServedReason::LargeTopology {
                nodes: built.descriptor.node_count(),
            })
        } else if !self.fits_inline(encoded.len()) {
            Some(ServedReason::OverCeiling {
                encoded_len: encoded.len(),
                ceiling: self.inline_ceiling,
            })
        } else {
            None
        };

        let decision = match reason {
            None => TransportDecision::Inline { encoded },
            Some(reason) => TransportDecision::Served {
                url: self.served_url(layout),
                reason,
            },
        };

        match &decision {
            TransportDecision::Inline { encoded } => {
                info!(encoded_len = encoded.len(), "descriptor passed inline");
            }
            TransportDecision::Served { url, reason } => {
                info!(%url, %reason, "descriptor served");
            }
        }
        Ok(decision)
    }
}

/// Compact JSON, base64 with the standard padded alphabet.
pub fn encode_inline(
    trimmed: &TrimmedDescriptor,
) -> Result<String, DescriptorError> {
    let json = serde_json::to_vec(trimmed)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

pub fn decode_inline(token: &str) -> Result<TrimmedDescriptor, DecodeError> {
    let json = base64::engine::general_purpose::STANDARD.decode(token.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

/// Pulls the inline descriptor out of a kernel command line.
pub fn decode_cmdline(cmdline: &str) -> Result<TrimmedDescriptor, DecodeError> {
    let value = cmdline
        .split_whitespace()
        .find_map(|word| {
            word.strip_prefix(DEPLOY_PARAM)?.strip_prefix('=')
        })
        .ok_or(DecodeError::MissingParam)?;

    if value.starts_with("http://") || value.starts_with("https://") {
        return Err(DecodeError::Served(value.to_owned()));
    }
    decode_inline(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::{DescriptorBuilder, PublicKey};
    use crate::roles::{
        resolve, RoleQuantity, RoleQuantityRequest, RoleSpec, RoleTemplate,
    };
    use crate::topology::{AllocationStrategy, Topology};
    use proptest::prelude::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG4 user@host";

    fn layout() -> EnvLayout {
        EnvLayout::new("/env", "webserver", "vm-ramdisk")
    }

    fn topology(nodes: u32) -> Topology {
        let spec: RoleSpec =
            [("node", RoleTemplate::new("/init/node"))].into_iter().collect();
        let request: RoleQuantityRequest =
            [("node", RoleQuantity::Count(nodes))].into_iter().collect();
        let resolved = resolve(&spec, &request).unwrap();
        AllocationStrategy::default().allocate(&spec, &resolved).unwrap()
    }

    fn built(nodes: u32, user: &str) -> BuiltDescriptor {
        DescriptorBuilder::new(
            &topology(nodes),
            PublicKey::new(KEY).unwrap(),
            user,
        )
        .composition("webserver")
        .build()
        .unwrap()
    }

    #[test]
    fn ceiling_is_inclusive() {
        let policy = TransportPolicy::default();
        assert_eq!(policy.inline_ceiling, 3840);
        assert!(policy.fits_inline(3840));
        assert!(!policy.fits_inline(3841));
    }

    #[test]
    fn small_descriptor_is_inline() {
        let decision =
            TransportPolicy::default().select(&built(2, "alice"), &layout()).unwrap();
        assert!(!decision.requires_content_server());
        assert!(decision.deploy_param().starts_with("deploy="));
    }

    #[test]
    fn encoded_length_boundary() {
        // Pad the user name until the compact JSON is 2880 bytes, which
        // encodes to exactly 3840 base64 bytes.
        let mut built = built(2, "");
        let base = serde_json::to_vec(&built.descriptor.trimmed()).unwrap().len();
        built.descriptor.user = "u".repeat(2880 - base);

        let policy = TransportPolicy::default();
        let decision = policy.select(&built, &layout()).unwrap();
        assert_eq!(decision.deploy_value().len(), 3840);
        assert!(matches!(decision, TransportDecision::Inline { .. }));

        built.descriptor.user.push('u');
        let decision = policy.select(&built, &layout()).unwrap();
        assert_eq!(
            decision,
            TransportDecision::Served {
                url: "http://10.0.2.2:8000/deploy/webserver::vm-ramdisk.json"
                    .into(),
                reason: ServedReason::OverCeiling {
                    encoded_len: 3844,
                    ceiling: 3840
                },
            }
        );
    }

    #[test]
    fn large_topology_is_served_even_when_small() {
        let built = built(6, "alice");
        assert!(built.exceeds_small_topology);
        let encoded = encode_inline(&built.descriptor.trimmed()).unwrap();
        assert!(encoded.len() < INLINE_CEILING);

        let policy = TransportPolicy {
            served_root: "http://files.example:8080/".into(),
            ..Default::default()
        };
        let decision = policy.select(&built, &layout()).unwrap();
        assert_eq!(
            decision,
            TransportDecision::Served {
                url: "http://files.example:8080/deploy/webserver::vm-ramdisk.json"
                    .into(),
                reason: ServedReason::LargeTopology { nodes: 6 },
            }
        );
        assert!(decision.requires_content_server());
    }

    #[test]
    fn inline_token_round_trips() {
        let built = built(3, "alice");
        let decision =
            TransportPolicy::default().select(&built, &layout()).unwrap();
        let decoded = decode_inline(decision.deploy_value()).unwrap();

        let hosts: Vec<_> = decoded
            .deployment
            .iter()
            .map(|(addr, n)| (addr.as_str(), n.role.as_str(), n.host.as_str()))
            .collect();
        assert_eq!(
            hosts,
            [
                ("10.0.2.15", "node", "node1"),
                ("10.0.2.16", "node", "node2"),
                ("10.0.2.17", "node", "node3"),
            ]
        );
        assert_eq!(decoded.ssh_key_pub, KEY);
        assert_eq!(decoded.user, "alice");

        let cmdline = format!(
            "init=/init/node {} console=tty0",
            decision.deploy_param()
        );
        assert_eq!(decode_cmdline(&cmdline).unwrap(), decoded);
    }

    #[test]
    fn decode_rejects_served_and_missing_params() {
        assert!(matches!(
            decode_cmdline("console=tty0"),
            Err(DecodeError::MissingParam)
        ));
        assert!(matches!(
            decode_cmdline("deploy=http://10.0.2.2:8000/deploy/a::b.json"),
            Err(DecodeError::Served(_))
        ));
        assert!(matches!(
            decode_inline("not base64!"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn policy_from_config() {
        let config = nxc_config_toml::Transport {
            inline_ceiling: Some(1024),
            ..Default::default()
        };
        let policy = TransportPolicy::from_config(&config);
        assert_eq!(policy.inline_ceiling, 1024);
        assert_eq!(policy.small_topology_threshold, SMALL_TOPOLOGY_THRESHOLD);
        assert_eq!(policy.served_root, DEFAULT_SERVED_ROOT);
    }

    proptest! {
        #[test]
        fn selection_is_deterministic(
            nodes in 1u32..12,
            user in "[a-z]{0,64}",
            ceiling in 0usize..4096,
        ) {
            let built = built(nodes, &user);
            let policy = TransportPolicy {
                inline_ceiling: ceiling,
                ..Default::default()
            };
            let first = policy.select(&built, &layout()).unwrap();
            let second = policy.select(&built.clone(), &layout()).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
