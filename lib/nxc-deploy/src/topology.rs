// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assignment of network identities to resolved role instances.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tracing::debug;

use crate::roles::{ResolvedRoles, RoleSpec};

/// First address handed to VM-local instances. QEMU's user-mode network
/// gives its first guest `10.0.2.15`.
pub const VM_BASE_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

/// First loopback address used in port-forwarding mode.
pub const FORWARD_BASE_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// First host port forwarded to a node's SSH server.
pub const FORWARD_BASE_PORT: u16 = 22022;

/// Errors that can arise while allocating a topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error(
        "{actual} addresses supplied for a topology of {expected} instances"
    )]
    AddressPoolMismatch { expected: usize, actual: usize },

    #[error("{count} instances do not fit in the address range starting at {base}")]
    AddressSpaceExhausted { base: Ipv4Addr, count: usize },

    #[error("{count} instances do not fit in the port range starting at {base}")]
    PortRangeExhausted { base: u16, count: usize },

    #[error("role {0} was resolved but is missing from the role spec")]
    MissingRole(String),

    // The two errors below indicate a defect in an allocation strategy
    // rather than bad input.
    #[error("internal error: address {0} allocated twice")]
    AddressInUse(IpAddr),

    #[error("internal error: port {0} allocated twice")]
    PortInUse(u16),
}

/// The key a node is reached by: an address, plus a port when the node is
/// reached through a forwarded port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkKey {
    pub addr: IpAddr,
    pub port: Option<u16>,
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.port) {
            (addr, None) => write!(f, "{addr}"),
            (IpAddr::V4(addr), Some(port)) => write!(f, "{addr}:{port}"),
            (IpAddr::V6(addr), Some(port)) => write!(f, "[{addr}]:{port}"),
        }
    }
}

/// A single node of a topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub key: NetworkKey,
    pub role: String,
    pub instance: String,

    /// The host label written into the deployment descriptor.
    pub host: String,

    pub init: String,
    pub vm_id: Option<u32>,
    pub qemu_script: Option<String>,
}

/// Which strategy produced a topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum AllocationKind {
    ExplicitAddresses,
    VmLocal,
    ForwardedPorts,
}

/// How to assign network identities to instances. The caller picks exactly
/// one strategy per run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Use these addresses, in order, one per instance.
    ExplicitAddresses(Vec<IpAddr>),

    /// Synthesize addresses in a private subnet starting at `base`, and give
    /// each instance a sequential VM slot.
    VmLocal { base: Ipv4Addr },

    /// Give each instance its own loopback address starting at `base_addr`
    /// and its own forwarded SSH port starting at `base_port`.
    ForwardedPorts { base_addr: Ipv4Addr, base_port: u16 },
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        Self::VmLocal { base: VM_BASE_ADDRESS }
    }
}

impl AllocationStrategy {
    pub fn forwarded_ports() -> Self {
        Self::ForwardedPorts {
            base_addr: FORWARD_BASE_ADDRESS,
            base_port: FORWARD_BASE_PORT,
        }
    }

    pub fn kind(&self) -> AllocationKind {
        match self {
            Self::ExplicitAddresses(_) => AllocationKind::ExplicitAddresses,
            Self::VmLocal { .. } => AllocationKind::VmLocal,
            Self::ForwardedPorts { .. } => AllocationKind::ForwardedPorts,
        }
    }

    /// Assigns a network identity to every instance in `resolved`, in role
    /// order and then instance order.
    pub fn allocate(
        &self,
        spec: &RoleSpec,
        resolved: &ResolvedRoles,
    ) -> Result<Topology, AllocationError> {
        let count = resolved.total();
        let mut builder = TopologyBuilder::new(self.kind());

        match self {
            Self::ExplicitAddresses(pool) => {
                if pool.len() != count {
                    return Err(AllocationError::AddressPoolMismatch {
                        expected: count,
                        actual: pool.len(),
                    });
                }

                for ((role, instance), addr) in resolved.instances().zip(pool)
                {
                    let init = role_init(spec, role)?;
                    builder.add_node(NodeIdentity {
                        key: NetworkKey { addr: *addr, port: None },
                        role: role.to_owned(),
                        instance: instance.to_owned(),
                        host: instance.to_owned(),
                        init,
                        vm_id: None,
                        qemu_script: role_qemu_script(spec, role),
                    })?;
                }
            }
            Self::VmLocal { base } => {
                let exhausted = || AllocationError::AddressSpaceExhausted {
                    base: *base,
                    count,
                };
                for (slot, (role, instance)) in resolved.instances().enumerate()
                {
                    let addr = offset_addr(*base, slot).ok_or_else(exhausted)?;
                    let vm_id = u32::try_from(slot).map_err(|_| exhausted())?;
                    builder.add_node(NodeIdentity {
                        key: NetworkKey { addr: addr.into(), port: None },
                        role: role.to_owned(),
                        instance: instance.to_owned(),
                        host: instance.to_owned(),
                        init: role_init(spec, role)?,
                        vm_id: Some(vm_id),
                        qemu_script: role_qemu_script(spec, role),
                    })?;
                }
            }
            Self::ForwardedPorts { base_addr, base_port } => {
                for (i, (role, instance)) in resolved.instances().enumerate() {
                    let addr = offset_addr(*base_addr, i).ok_or(
                        AllocationError::AddressSpaceExhausted {
                            base: *base_addr,
                            count,
                        },
                    )?;
                    let port = u16::try_from(i)
                        .ok()
                        .and_then(|i| base_port.checked_add(i))
                        .ok_or(AllocationError::PortRangeExhausted {
                            base: *base_port,
                            count,
                        })?;

                    // Forwarded nodes are addressed through the host, so the
                    // role itself is the label the node boots as.
                    builder.add_node(NodeIdentity {
                        key: NetworkKey { addr: addr.into(), port: Some(port) },
                        role: role.to_owned(),
                        instance: instance.to_owned(),
                        host: role.to_owned(),
                        init: role_init(spec, role)?,
                        vm_id: None,
                        qemu_script: role_qemu_script(spec, role),
                    })?;
                }
            }
        }

        let topology = builder.finish();
        debug!(
            strategy = %topology.kind,
            nodes = topology.len(),
            "allocated topology"
        );
        Ok(topology)
    }
}

fn role_init(spec: &RoleSpec, role: &str) -> Result<String, AllocationError> {
    spec.get(role)
        .map(|t| t.init.clone())
        .ok_or_else(|| AllocationError::MissingRole(role.to_owned()))
}

fn role_qemu_script(spec: &RoleSpec, role: &str) -> Option<String> {
    spec.get(role).and_then(|t| t.qemu_script.clone())
}

/// Returns `base` with `offset` added to its last octet, as long as the
/// result stays a unicast host address in the same /24.
fn offset_addr(base: Ipv4Addr, offset: usize) -> Option<Ipv4Addr> {
    let [a, b, c, d] = base.octets();
    let d = u8::try_from(usize::from(d).checked_add(offset)?).ok()?;
    (d != u8::MAX).then(|| Ipv4Addr::new(a, b, c, d))
}

/// Accumulates nodes while checking that no network key is handed out
/// twice.
#[derive(Debug)]
struct TopologyBuilder {
    kind: AllocationKind,
    nodes: Vec<NodeIdentity>,
    addrs: BTreeSet<IpAddr>,
    ports: BTreeSet<u16>,
}

impl TopologyBuilder {
    fn new(kind: AllocationKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
            addrs: BTreeSet::new(),
            ports: BTreeSet::new(),
        }
    }

    fn add_node(&mut self, node: NodeIdentity) -> Result<(), AllocationError> {
        // The descriptor is keyed by address alone, so addresses must be
        // unique even when ports differ.
        if self.addrs.contains(&node.key.addr) {
            return Err(AllocationError::AddressInUse(node.key.addr));
        }

        if let Some(port) = node.key.port {
            if !self.ports.insert(port) {
                return Err(AllocationError::PortInUse(port));
            }
        }

        self.addrs.insert(node.key.addr);
        self.nodes.push(node);
        Ok(())
    }

    fn finish(self) -> Topology {
        Topology { kind: self.kind, nodes: self.nodes }
    }
}

/// Nodes keyed by network identity, in allocation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    kind: AllocationKind,
    nodes: Vec<NodeIdentity>,
}

impl Topology {
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.nodes.iter()
    }

    pub fn get(&self, addr: IpAddr) -> Option<&NodeIdentity> {
        self.nodes.iter().find(|n| n.key.addr == addr)
    }

    /// Addresses of every node, in allocation order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.nodes.iter().map(|n| n.key.addr).collect()
    }
}
