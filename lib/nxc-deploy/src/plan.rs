// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The deployment pipeline: resolve, allocate, describe, pick a transport,
//! and finally write the results out.

use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::boot_script::BootScriptGenerator;
use crate::descriptor::{
    BuiltDescriptor, DescriptorBuilder, PublicKey, SharedImageRefs,
};
use crate::error::Result;
use crate::layout::EnvLayout;
use crate::roles::{resolve, ResolvedRoles, RoleQuantityRequest, RoleSpec};
use crate::topology::{AllocationKind, AllocationStrategy, Topology};
use crate::transport::{TransportDecision, TransportPolicy};

/// Everything a run needs to know up front.
#[derive(Clone, Debug)]
pub struct PlanInputs<'a> {
    pub layout: &'a EnvLayout,
    pub roles: &'a RoleSpec,
    pub shared_images: Option<&'a SharedImageRefs>,
    pub request: &'a RoleQuantityRequest,
    pub strategy: &'a AllocationStrategy,
    pub policy: &'a TransportPolicy,
    pub public_key: PublicKey,
    pub user: String,

    /// Recorded in the descriptor when set.
    pub composition: Option<String>,
}

/// The computed, not yet written, outcome of a run.
#[derive(Clone, Debug)]
pub struct Plan {
    pub roles: RoleSpec,
    pub resolved: ResolvedRoles,
    pub topology: Topology,
    pub built: BuiltDescriptor,
    pub decision: TransportDecision,
    pub public_key: PublicKey,
}

/// Paths written by [`Plan::write`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenArtifacts {
    pub descriptor: Utf8PathBuf,
    pub scripts: Vec<Utf8PathBuf>,
    pub requires_content_server: bool,
}

impl Plan {
    /// Runs every stage that doesn't touch the filesystem.
    pub fn build(inputs: &PlanInputs<'_>) -> Result<Self> {
        let resolved = resolve(inputs.roles, inputs.request)?;
        let topology = inputs.strategy.allocate(inputs.roles, &resolved)?;

        let mut builder = DescriptorBuilder::new(
            &topology,
            inputs.public_key.clone(),
            inputs.user.clone(),
        );
        builder
            .shared_images(inputs.shared_images)
            .small_topology_threshold(inputs.policy.small_topology_threshold);
        if let Some(composition) = &inputs.composition {
            builder.composition(composition.clone());
        }
        let built = builder.build()?;

        let decision = inputs.policy.select(&built, inputs.layout)?;

        Ok(Self {
            roles: inputs.roles.clone(),
            resolved,
            topology,
            built,
            decision,
            public_key: inputs.public_key.clone(),
        })
    }

    /// In port-forwarding mode, the kernel parameter handing the public key
    /// to the VMs.
    pub fn forwarded_key_param(&self) -> Option<String> {
        (self.topology.kind() == AllocationKind::ForwardedPorts)
            .then(|| self.public_key.kernel_param())
    }

    /// Writes the descriptor and then the boot scripts. Boot images are
    /// looked up before anything is written, so a missing image leaves the
    /// environment untouched.
    pub fn write(
        &self,
        generator: &BootScriptGenerator,
    ) -> Result<WrittenArtifacts> {
        let layout = generator.layout();
        let scripts = generator.generate(
            &self.built.descriptor,
            &self.roles,
            &self.decision,
        )?;

        let descriptor = layout.deployment_file();
        self.built.descriptor.write(&descriptor)?;
        generator.write(&scripts)?;

        let requires_content_server = self.decision.requires_content_server();
        if requires_content_server {
            warn!(
                root = %layout.envdir(),
                url = self.decision.deploy_value(),
                "descriptor is served; a content server must serve the \
                 environment directory while nodes boot"
            );
        }
        info!(
            descriptor = %descriptor,
            scripts = scripts.len(),
            "deployment written"
        );

        Ok(WrittenArtifacts {
            descriptor,
            scripts: scripts.into_iter().map(|s| s.path).collect(),
            requires_content_server,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::roles::{ResolveError, RoleQuantity, RoleTemplate};
    use crate::store::StoreResolver;
    use crate::topology::AllocationError;

    const KEY: &str = "ssh-rsa AAAAB3NzaC1yc2E user@host";

    fn roles() -> RoleSpec {
        [
            ("server", RoleTemplate::new("/init/server")),
            ("client", RoleTemplate::new("/init/client")),
        ]
        .into_iter()
        .collect()
    }

    fn inputs<'a>(
        layout: &'a EnvLayout,
        roles: &'a RoleSpec,
        request: &'a RoleQuantityRequest,
        strategy: &'a AllocationStrategy,
        policy: &'a TransportPolicy,
    ) -> PlanInputs<'a> {
        PlanInputs {
            layout,
            roles,
            shared_images: None,
            request,
            strategy,
            policy,
            public_key: PublicKey::new(KEY).unwrap(),
            user: "alice".into(),
            composition: Some("webserver".into()),
        }
    }

    #[test]
    fn conflicting_names_fail_before_allocation() {
        let layout = EnvLayout::new("/env", "webserver", "vm");
        let roles = roles();
        let request: RoleQuantityRequest = [
            ("server", RoleQuantity::Names(vec!["web".into()])),
            ("client", RoleQuantity::Names(vec!["web".into()])),
        ]
        .into_iter()
        .collect();
        let strategy = AllocationStrategy::default();
        let policy = TransportPolicy::default();

        let err = Plan::build(&inputs(&layout, &roles, &request, &strategy, &policy))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolve(ResolveError::NamingConflict { .. })
        ));
    }

    #[test]
    fn address_pool_mismatch_is_an_allocation_error() {
        let layout = EnvLayout::new("/env", "webserver", "vm");
        let roles = roles();
        let request = RoleQuantityRequest::new();
        let strategy = AllocationStrategy::ExplicitAddresses(vec![
            "192.168.1.10".parse().unwrap(),
        ]);
        let policy = TransportPolicy::default();

        let err = Plan::build(&inputs(&layout, &roles, &request, &strategy, &policy))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Allocation(AllocationError::AddressPoolMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn forwarded_plans_carry_the_key_param() {
        let layout = EnvLayout::new("/env", "webserver", "vm");
        let roles = roles();
        let request = RoleQuantityRequest::new();
        let policy = TransportPolicy::default();

        let vm = AllocationStrategy::default();
        let plan =
            Plan::build(&inputs(&layout, &roles, &request, &vm, &policy)).unwrap();
        assert_eq!(plan.forwarded_key_param(), None);
        assert_eq!(plan.built.descriptor.composition.as_deref(), Some("webserver"));

        let forwarded = AllocationStrategy::forwarded_ports();
        let plan =
            Plan::build(&inputs(&layout, &roles, &request, &forwarded, &policy))
                .unwrap();
        let param = plan.forwarded_key_param().unwrap();
        assert!(param.starts_with("ssh_key.pub:"));
    }

    #[test]
    fn policy_threshold_reaches_the_builder() {
        let layout = EnvLayout::new("/env", "webserver", "vm");
        let roles = roles();
        let request: RoleQuantityRequest =
            [("client", RoleQuantity::Count(5))].into_iter().collect();
        let strategy = AllocationStrategy::default();

        let policy = TransportPolicy::default();
        let plan = Plan::build(&inputs(&layout, &roles, &request, &strategy, &policy))
            .unwrap();
        assert!(plan.decision.requires_content_server());

        let policy =
            TransportPolicy { small_topology_threshold: 6, ..Default::default() };
        let plan = Plan::build(&inputs(&layout, &roles, &request, &strategy, &policy))
            .unwrap();
        assert!(!plan.decision.requires_content_server());
    }

    #[test]
    fn missing_images_leave_the_environment_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let envdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let layout = EnvLayout::new(envdir, "webserver", "vm");
        let roles = roles();
        let request = RoleQuantityRequest::new();
        let strategy = AllocationStrategy::default();
        let policy = TransportPolicy::default();

        let plan = Plan::build(&inputs(&layout, &roles, &request, &strategy, &policy))
            .unwrap();
        let generator =
            BootScriptGenerator::new(layout.clone(), StoreResolver::default());
        assert!(matches!(plan.write(&generator), Err(Error::BootScript(_))));
        assert!(!layout.deploy_dir().exists());
        assert!(!layout.kexec_scripts_dir().exists());
    }
}
