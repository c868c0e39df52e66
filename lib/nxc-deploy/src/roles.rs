// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Roles, the quantities requested for them, and their expansion into
//! concrete instance names.

use std::collections::BTreeMap;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The largest instance count a single role may request.
pub const MAX_INSTANCES: u32 = u16::MAX as u32;

/// Errors that can arise while turning role quantities into instance names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error(
        "instance name {name} is requested by both role {first_role} and \
         role {second_role}"
    )]
    NamingConflict { name: String, first_role: String, second_role: String },

    #[error("unsupported quantity for role {role}: {reason}")]
    UnsupportedQuantityType { role: String, reason: String },

    #[error("quantity requested for role {0}, which the composition does not define")]
    UnknownRole(String),

    #[error(
        "{kind} name {name:?} may only contain ASCII letters, digits, '.', \
         '_' and '-', and may not start with '.' or '-'"
    )]
    InvalidName { kind: &'static str, name: String },
}

/// The template every instance of a role is booted from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleTemplate {
    /// Path to the init process the role's nodes boot into.
    pub init: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,

    /// Script that launches a VM for this role, when the flavour has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl RoleTemplate {
    pub fn new(init: impl Into<String>) -> Self {
        Self {
            init: init.into(),
            kernel: None,
            initrd: None,
            qemu_script: None,
            image: None,
        }
    }
}

/// The roles of a composition, in declaration order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RoleSpec(IndexMap<String, RoleTemplate>);

impl RoleSpec {
    pub fn get(&self, role: &str) -> Option<&RoleTemplate> {
        self.0.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains_key(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RoleTemplate)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, RoleTemplate)> for RoleSpec {
    fn from_iter<I: IntoIterator<Item = (S, RoleTemplate)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// How many instances of a role to deploy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RoleQuantity {
    /// A number of instances, named after the role.
    Count(u32),

    /// Explicit instance names, used verbatim.
    Names(Vec<String>),
}

impl RoleQuantity {
    /// Interprets an arbitrary JSON value as a quantity for `role`.
    pub fn from_value(
        role: &str,
        value: &serde_json::Value,
    ) -> Result<Self, ResolveError> {
        let unsupported = |reason: &str| ResolveError::UnsupportedQuantityType {
            role: role.to_owned(),
            reason: reason.to_owned(),
        };

        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(RoleQuantity::Count)
                .ok_or_else(|| unsupported("count must be a positive integer")),
            serde_json::Value::Array(names) => names
                .iter()
                .map(|n| {
                    n.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| unsupported("names must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(RoleQuantity::Names),
            _ => Err(unsupported(
                "expected an instance count or a list of instance names",
            )),
        }
    }

    /// Expands this quantity into instance names for `role`.
    fn expand(&self, role: &str) -> Result<Vec<String>, ResolveError> {
        match self {
            RoleQuantity::Count(0) => {
                Err(ResolveError::UnsupportedQuantityType {
                    role: role.to_owned(),
                    reason: "count must be at least 1".to_owned(),
                })
            }
            RoleQuantity::Count(n) if *n > MAX_INSTANCES => {
                Err(ResolveError::UnsupportedQuantityType {
                    role: role.to_owned(),
                    reason: format!(
                        "count {n} exceeds the limit of {MAX_INSTANCES} instances"
                    ),
                })
            }
            RoleQuantity::Count(1) => Ok(vec![role.to_owned()]),
            RoleQuantity::Count(n) => {
                Ok((1..=*n).map(|i| format!("{role}{i}")).collect())
            }
            RoleQuantity::Names(names) if names.is_empty() => {
                Err(ResolveError::UnsupportedQuantityType {
                    role: role.to_owned(),
                    reason: "name list is empty".to_owned(),
                })
            }
            RoleQuantity::Names(names) => Ok(names.clone()),
        }
    }
}

/// Parses the command-line forms `N` and `name1,name2,...`.
impl FromStr for RoleQuantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty role quantity".to_owned());
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse()
                .map(RoleQuantity::Count)
                .map_err(|e| format!("invalid instance count {s:?}: {e}"));
        }

        Ok(RoleQuantity::Names(
            s.split(',').map(|n| n.trim().to_owned()).collect(),
        ))
    }
}

/// Requested quantities, keyed by role. Roles absent from the request get a
/// single instance named after the role.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RoleQuantityRequest(IndexMap<String, RoleQuantity>);

impl RoleQuantityRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: impl Into<String>, quantity: RoleQuantity) {
        self.0.insert(role.into(), quantity);
    }

    pub fn get(&self, role: &str) -> Option<&RoleQuantity> {
        self.0.get(role)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds a request from a JSON object mapping role names to counts or
    /// name lists.
    pub fn from_json_value(
        value: &serde_json::Value,
    ) -> Result<Self, ResolveError> {
        let obj = value.as_object().ok_or_else(|| {
            ResolveError::UnsupportedQuantityType {
                role: "*".to_owned(),
                reason: "role quantities must be a JSON object".to_owned(),
            }
        })?;

        obj.iter()
            .map(|(role, v)| {
                RoleQuantity::from_value(role, v).map(|q| (role.clone(), q))
            })
            .collect::<Result<IndexMap<_, _>, _>>()
            .map(Self)
    }
}

impl<S: Into<String>> FromIterator<(S, RoleQuantity)> for RoleQuantityRequest {
    fn from_iter<I: IntoIterator<Item = (S, RoleQuantity)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Instance names for every role, in role declaration order. No instance
/// name appears twice.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ResolvedRoles(IndexMap<String, Vec<String>>);

impl ResolvedRoles {
    pub fn get(&self, role: &str) -> Option<&[String]> {
        self.0.get(role).map(Vec::as_slice)
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Yields `(role, instance)` pairs in role order, then instance order.
    pub fn instances(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(role, names)| {
            names.iter().map(move |n| (role.as_str(), n.as_str()))
        })
    }

    /// The total number of instances across all roles.
    pub fn total(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

/// Returns true if `name` is safe to use as a hostname, a shell word and a
/// path component.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(['.', '-'])
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b))
}

fn check_name(kind: &'static str, name: &str) -> Result<(), ResolveError> {
    if is_safe_name(name) {
        Ok(())
    } else {
        Err(ResolveError::InvalidName { kind, name: name.to_owned() })
    }
}

/// Expands `request` against the roles in `spec`.
///
/// Every role in `spec` is resolved, in declaration order; roles missing
/// from the request get one instance named after the role. Fails if the
/// request names an unknown role or if two instances, in the same role or
/// in different roles, end up with the same name.
pub fn resolve(
    spec: &RoleSpec,
    request: &RoleQuantityRequest,
) -> Result<ResolvedRoles, ResolveError> {
    if let Some(unknown) = request.0.keys().find(|r| !spec.contains(r)) {
        return Err(ResolveError::UnknownRole(unknown.clone()));
    }

    let mut resolved = IndexMap::with_capacity(spec.len());
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for role in spec.names() {
        check_name("role", role)?;
        let names = match request.get(role) {
            Some(quantity) => quantity.expand(role)?,
            None => vec![role.to_owned()],
        };

        for name in &names {
            check_name("instance", name)?;
            if let Some(first_role) =
                owners.insert(name.clone(), role.to_owned())
            {
                return Err(ResolveError::NamingConflict {
                    name: name.clone(),
                    first_role,
                    second_role: role.to_owned(),
                });
            }
        }

        resolved.insert(role.to_owned(), names);
    }

    Ok(ResolvedRoles(resolved))
}
