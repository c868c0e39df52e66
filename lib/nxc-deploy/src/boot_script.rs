// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generation of the kexec scripts that stage a deployment's kernel and
//! initrd on a node and jump into them.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::descriptor::DeploymentDescriptor;
use crate::layout::{self, EnvLayout};
use crate::roles::{is_safe_name, RoleSpec};
use crate::store::{StoreError, StoreResolver};
use crate::transport::TransportDecision;

pub const SHARED_SCRIPT_NAME: &str = "kexec.sh";
pub const DEFAULT_SUDO: &str = "sudo";
pub const DEFAULT_CONSOLE_PARAMS: [&str; 2] =
    ["console=tty0", "console=ttyS0,115200"];

#[derive(Debug, Error)]
pub enum BootScriptError {
    #[error("boot image not found")]
    Store(#[from] StoreError),

    #[error("role {0} is deployed but the composition does not define it")]
    UnknownRole(String),

    #[error("role name {0:?} cannot be used in a script file name")]
    UnsafeRoleName(String),

    #[error("{what} {value:?} cannot be placed on a kernel command line")]
    UnsafeParam { what: &'static str, value: String },

    #[error("failed to write {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A generated script, not yet written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootScript {
    pub path: Utf8PathBuf,

    /// The role this script boots, or `None` for the shared script.
    pub role: Option<String>,

    pub contents: String,
}

/// The inputs of a single script.
struct ScriptParams<'a> {
    kernel: &'a Utf8Path,
    initrd: &'a Utf8Path,
    init: Option<&'a str>,
    deploy_param: &'a str,
}

#[derive(Clone, Debug)]
pub struct BootScriptGenerator {
    layout: EnvLayout,
    resolver: StoreResolver,
    sudo: String,
    console: Vec<String>,
}

impl BootScriptGenerator {
    pub fn new(layout: EnvLayout, resolver: StoreResolver) -> Self {
        Self {
            layout,
            resolver,
            sudo: DEFAULT_SUDO.to_owned(),
            console: DEFAULT_CONSOLE_PARAMS.map(String::from).to_vec(),
        }
    }

    pub fn from_config(
        layout: EnvLayout,
        resolver: StoreResolver,
        config: &nxc_config_toml::Kexec,
    ) -> Self {
        let mut generator = Self::new(layout, resolver);
        if let Some(sudo) = &config.sudo {
            generator.sudo = sudo.clone();
        }
        if let Some(console) = &config.console {
            generator.console = console.clone();
        }
        generator
    }

    /// Overrides the default privilege-escalation command.
    pub fn with_sudo(mut self, sudo: impl Into<String>) -> Self {
        self.sudo = sudo.into();
        self
    }

    pub fn layout(&self) -> &EnvLayout {
        &self.layout
    }

    /// Builds the scripts for `descriptor` without touching the filesystem
    /// beyond looking up boot images. Any missing image fails the whole
    /// generation.
    ///
    /// With shared images this is a single `kexec.sh`. Otherwise there is
    /// one `kexec_<role>.sh` per deployed role, each passing the role's init
    /// on the command line.
    pub fn generate(
        &self,
        descriptor: &DeploymentDescriptor,
        roles: &RoleSpec,
        decision: &TransportDecision,
    ) -> Result<Vec<BootScript>, BootScriptError> {
        let deploy_param = decision.deploy_param();
        check_param("deploy parameter", &deploy_param)?;
        for param in &self.console {
            check_param("console parameter", param)?;
        }

        let dir = self.layout.kexec_scripts_dir();

        if let Some(all) = &descriptor.all {
            let kernel = self.resolver.resolve(&all.kernel)?;
            let initrd = self.resolver.resolve(&all.initrd)?;
            let contents = self.render(&ScriptParams {
                kernel: &kernel,
                initrd: &initrd,
                init: None,
                deploy_param: &deploy_param,
            });
            return Ok(vec![BootScript {
                path: dir.join(SHARED_SCRIPT_NAME),
                role: None,
                contents,
            }]);
        }

        let mut scripts: Vec<BootScript> = Vec::new();
        for node in descriptor.deployment.values() {
            let role = node.role.as_str();
            if scripts.iter().any(|s| s.role.as_deref() == Some(role)) {
                continue;
            }
            if !is_safe_name(role) {
                return Err(BootScriptError::UnsafeRoleName(role.to_owned()));
            }
            check_param("init path", &node.init)?;

            let template = roles
                .get(role)
                .ok_or_else(|| BootScriptError::UnknownRole(role.to_owned()))?;
            let kernel = self.role_image(template.kernel.as_deref(), "kernel", role)?;
            let initrd = self.role_image(template.initrd.as_deref(), "initrd", role)?;

            let contents = self.render(&ScriptParams {
                kernel: &kernel,
                initrd: &initrd,
                init: Some(&node.init),
                deploy_param: &deploy_param,
            });
            scripts.push(BootScript {
                path: dir.join(format!("kexec_{role}.sh")),
                role: Some(role.to_owned()),
                contents,
            });
        }

        Ok(scripts)
    }

    /// Writes `scripts`, replacing any previous script at the same path.
    pub fn write(&self, scripts: &[BootScript]) -> Result<(), BootScriptError> {
        let dir = self.layout.kexec_scripts_dir();
        layout::ensure_dir(&dir, 0o700)
            .map_err(|source| BootScriptError::Io { path: dir.clone(), source })?;

        for script in scripts {
            layout::write_replace(&script.path, script.contents.as_bytes(), 0o755)
                .map_err(|source| BootScriptError::Io {
                    path: script.path.clone(),
                    source,
                })?;
            info!(path = %script.path, role = ?script.role, "wrote boot script");
        }
        Ok(())
    }

    /// A role's kernel or initrd: the one its template names, or the
    /// per-role copy in the artifact directory.
    fn role_image(
        &self,
        named: Option<&str>,
        kind: &str,
        role: &str,
    ) -> Result<Utf8PathBuf, StoreError> {
        match named {
            Some(path) => self.resolver.resolve(path),
            None => {
                let path = self.layout.artifact_dir().join(format!("{kind}_{role}"));
                self.resolver.resolve(path.as_str())
            }
        }
    }

    fn render(&self, params: &ScriptParams<'_>) -> String {
        let mut append = String::new();
        if let Some(init) = params.init {
            append.push_str(&format!("init={init} "));
        }
        append.push_str(params.deploy_param);
        for param in &self.console {
            append.push(' ');
            append.push_str(param);
        }

        let lines = [
            "#!/usr/bin/env bash".to_owned(),
            format!(": ${{SUDO:={}}}", shell_word(&self.sudo)),
            format!(": ${{KERNEL:={}}}", shell_word(params.kernel.as_str())),
            format!(": ${{INITRD:={}}}", shell_word(params.initrd.as_str())),
            format!(
                "$SUDO kexec -l \"$KERNEL\" --initrd=\"$INITRD\" \
                 --append=\"{append}${{DEBUG_INITRD:+ $DEBUG_INITRD}}\""
            ),
            "$SUDO kexec -e".to_owned(),
        ];
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

/// Rejects values that would split a kernel parameter or be expanded by
/// the shell inside the double-quoted `--append` argument.
fn check_param(what: &'static str, value: &str) -> Result<(), BootScriptError> {
    let unsafe_char =
        |c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '$' | '`' | '\\');
    if value.is_empty() || value.contains(unsafe_char) {
        return Err(BootScriptError::UnsafeParam { what, value: value.to_owned() });
    }
    Ok(())
}

/// Quotes `s` for use as a single shell word. Plain words are left alone.
fn shell_word(s: &str) -> String {
    let plain = !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"._/:=,+-@%".contains(&b)
        });
    if plain {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
