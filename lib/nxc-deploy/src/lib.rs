// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment planning for composed NixOS environments.
//!
//! A run turns a composition's roles and the requested instance quantities
//! into a [`topology::Topology`], describes it in a
//! [`descriptor::DeploymentDescriptor`], decides how booting nodes receive
//! that descriptor, and writes kexec scripts that boot them.

pub mod boot_script;
pub mod compose_info;
pub mod descriptor;
mod error;
pub mod layout;
pub mod plan;
pub mod roles;
pub mod store;
pub mod topology;
pub mod transport;

pub use error::{Error, Result};
pub use plan::{Plan, PlanInputs, WrittenArtifacts};
