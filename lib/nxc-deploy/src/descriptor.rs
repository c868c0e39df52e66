// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The deployment descriptor: the document a booting node reads to learn
//! which role and host it is, and which images the deployment shares.

use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::layout;
use crate::topology::Topology;

/// Topologies with more nodes than this prefer served delivery.
pub const SMALL_TOPOLOGY_THRESHOLD: usize = 4;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read public key {path}")]
    PublicKey {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("public key {0} is empty")]
    EmptyPublicKey(String),

    #[error("no public key given and $HOME is not set")]
    NoDefaultPublicKey,

    #[error("shared images are missing the required field \"{0}\"")]
    MissingSharedImageField(&'static str),

    #[error("failed to serialize deployment descriptor")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to parse deployment descriptor {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to access {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An SSH public key handed to every deployed node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn new(contents: &str) -> Result<Self, DescriptorError> {
        let key = contents.trim_end();
        if key.trim_start().is_empty() {
            return Err(DescriptorError::EmptyPublicKey("<inline>".to_owned()));
        }
        Ok(Self(key.to_owned()))
    }

    pub fn from_path(path: &Utf8Path) -> Result<Self, DescriptorError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            DescriptorError::PublicKey { path: path.to_path_buf(), source }
        })?;
        Self::new(&contents).map_err(|_| {
            DescriptorError::EmptyPublicKey(path.to_string())
        })
    }

    /// `$HOME/.ssh/id_rsa.pub`.
    pub fn default_path() -> Result<Utf8PathBuf, DescriptorError> {
        std::env::var("HOME")
            .map(|home| Utf8PathBuf::from(home).join(".ssh/id_rsa.pub"))
            .map_err(|_| DescriptorError::NoDefaultPublicKey)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kernel parameter that hands the key to nodes reached through
    /// forwarded ports, which cannot fetch a descriptor before their SSH
    /// server is configured.
    pub fn kernel_param(&self) -> String {
        format!(
            "ssh_key.pub:{}",
            base64::engine::general_purpose::STANDARD.encode(&self.0)
        )
    }
}

/// Images shared by every node, as listed in compose info. Nothing is
/// required here; [`SharedImages`] is the validated form.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SharedImageRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu_script: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One kernel/initrd pair (plus optional extras) booted by every node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SharedImages {
    pub kernel: String,
    pub initrd: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu_script: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<&SharedImageRefs> for SharedImages {
    type Error = DescriptorError;

    fn try_from(refs: &SharedImageRefs) -> Result<Self, Self::Error> {
        Ok(Self {
            kernel: refs
                .kernel
                .clone()
                .ok_or(DescriptorError::MissingSharedImageField("kernel"))?,
            initrd: refs
                .initrd
                .clone()
                .ok_or(DescriptorError::MissingSharedImageField("initrd"))?,
            image: refs.image.clone(),
            qemu_script: refs.qemu_script.clone(),
            extra: refs.extra.clone(),
        })
    }
}

/// A node's entry in the descriptor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub role: String,
    pub host: String,
    pub init: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu_script: Option<String>,

    #[serde(default, rename = "ssh-port", skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
}

/// The full deployment descriptor, as written to
/// `<envdir>/deploy/<composition>::<flavour>.json`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeploymentDescriptor {
    #[serde(rename = "ssh_key.pub")]
    pub ssh_key_pub: String,

    /// Node records keyed by address, in allocation order.
    pub deployment: IndexMap<String, NodeRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<SharedImages>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<String>,

    pub user: String,
}

/// A node's entry in the trimmed descriptor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrimmedNode {
    pub role: String,
    pub host: String,
}

/// The descriptor minus the per-node fields a booting node doesn't need.
/// This is what gets embedded in kernel parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrimmedDescriptor {
    #[serde(rename = "ssh_key.pub")]
    pub ssh_key_pub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<SharedImages>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<String>,

    pub user: String,

    pub deployment: IndexMap<String, TrimmedNode>,
}

impl DeploymentDescriptor {
    pub fn node_count(&self) -> usize {
        self.deployment.len()
    }

    /// True if every node boots the same shared kernel and initrd.
    pub fn is_shared_image(&self) -> bool {
        self.all.is_some()
    }

    pub fn trimmed(&self) -> TrimmedDescriptor {
        TrimmedDescriptor {
            ssh_key_pub: self.ssh_key_pub.clone(),
            all: self.all.clone(),
            composition: self.composition.clone(),
            user: self.user.clone(),
            deployment: self
                .deployment
                .iter()
                .map(|(addr, node)| {
                    (
                        addr.clone(),
                        TrimmedNode {
                            role: node.role.clone(),
                            host: node.host.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String, DescriptorError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_path(path: &Utf8Path) -> Result<Self, DescriptorError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            DescriptorError::Io { path: path.to_path_buf(), source }
        })?;
        serde_json::from_str(&contents).map_err(|source| {
            DescriptorError::Parse { path: path.to_path_buf(), source }
        })
    }

    /// Writes the descriptor to `path`, creating its directory if needed and
    /// replacing any previous descriptor there.
    pub fn write(&self, path: &Utf8Path) -> Result<(), DescriptorError> {
        let io_err = |source| DescriptorError::Io { path: path.to_path_buf(), source };

        if let Some(dir) = path.parent() {
            layout::ensure_dir(dir, 0o755).map_err(io_err)?;
        }

        let json = self.to_pretty_json()?;
        layout::write_replace(path, json.as_bytes(), 0o644).map_err(io_err)?;
        info!(%path, nodes = self.node_count(), "wrote deployment descriptor");
        Ok(())
    }
}

/// A freshly built descriptor, along with what the builder learned about it.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltDescriptor {
    pub descriptor: DeploymentDescriptor,

    /// True if the topology has more nodes than the small-topology
    /// threshold.
    pub exceeds_small_topology: bool,
}

/// Assembles a [`DeploymentDescriptor`] from a topology and run metadata.
#[derive(Clone, Debug)]
pub struct DescriptorBuilder<'a> {
    topology: &'a Topology,
    public_key: PublicKey,
    user: String,
    composition: Option<String>,
    shared_images: Option<&'a SharedImageRefs>,
    small_topology_threshold: usize,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(
        topology: &'a Topology,
        public_key: PublicKey,
        user: impl Into<String>,
    ) -> Self {
        Self {
            topology,
            public_key,
            user: user.into(),
            composition: None,
            shared_images: None,
            small_topology_threshold: SMALL_TOPOLOGY_THRESHOLD,
        }
    }

    pub fn composition(&mut self, name: impl Into<String>) -> &mut Self {
        self.composition = Some(name.into());
        self
    }

    pub fn shared_images(
        &mut self,
        images: Option<&'a SharedImageRefs>,
    ) -> &mut Self {
        self.shared_images = images;
        self
    }

    pub fn small_topology_threshold(&mut self, threshold: usize) -> &mut Self {
        self.small_topology_threshold = threshold;
        self
    }

    pub fn build(&self) -> Result<BuiltDescriptor, DescriptorError> {
        let all = self
            .shared_images
            .map(SharedImages::try_from)
            .transpose()?;

        // With shared images, no node has images of its own.
        let per_node_images = all.is_none();
        let deployment = self
            .topology
            .iter()
            .map(|node| {
                (
                    node.key.addr.to_string(),
                    NodeRecord {
                        role: node.role.clone(),
                        host: node.host.clone(),
                        init: node.init.clone(),
                        vm_id: node.vm_id,
                        qemu_script: node
                            .qemu_script
                            .clone()
                            .filter(|_| per_node_images),
                        ssh_port: node.key.port,
                    },
                )
            })
            .collect::<IndexMap<_, _>>();

        let exceeds_small_topology =
            deployment.len() > self.small_topology_threshold;

        Ok(BuiltDescriptor {
            descriptor: DeploymentDescriptor {
                ssh_key_pub: self.public_key.as_str().to_owned(),
                deployment,
                all,
                composition: self.composition.clone(),
                user: self.user.clone(),
            },
            exceeds_small_topology,
        })
    }
}
