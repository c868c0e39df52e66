// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::IpAddr;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use nxc_deploy::layout::EnvLayout;
use nxc_deploy::roles::RoleQuantity;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write the deployment descriptor and kexec scripts for a composition.
    Deploy(DeployOptions),

    /// Print the topology a deployment would get, without writing anything.
    Topology(TopologyOptions),

    /// Print the descriptor carried inline by a deploy= kernel parameter.
    Decode(DecodeOptions),
}

/// Plans deployments of composed NixOS environments.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
pub struct EnvOptions {
    /// The environment directory holding build outputs and nxc.toml.
    #[clap(long, env = "NXC_ENVDIR", default_value = ".", value_parser)]
    pub envdir: Utf8PathBuf,

    /// The composition to deploy.
    #[clap(long, short)]
    pub composition: String,

    /// The flavour the composition was built for.
    #[clap(long, short)]
    pub flavour: String,
}

impl EnvOptions {
    pub fn layout(&self) -> EnvLayout {
        EnvLayout::new(
            self.envdir.clone(),
            self.composition.clone(),
            self.flavour.clone(),
        )
    }
}

#[derive(Args, Debug)]
pub struct TopologyOptions {
    #[clap(flatten)]
    pub env: EnvOptions,

    /// Instances of a role, as ROLE=COUNT or ROLE=NAME1,NAME2,... Roles not
    /// listed get one instance named after the role.
    #[clap(
        long = "role-quantity",
        short = 'r',
        value_name = "ROLE=QUANTITY",
        value_parser = parse_role_quantity
    )]
    pub role_quantities: Vec<(String, RoleQuantity)>,

    /// A JSON object mapping roles to instance counts or name lists.
    #[clap(long, value_parser, conflicts_with = "role_quantities")]
    pub roles_file: Option<Utf8PathBuf>,

    /// A file listing one machine per line. Each machine is resolved to an
    /// address and handed to an instance, in order.
    #[clap(long, value_parser, conflicts_with_all = ["ip", "forward_ssh_port"])]
    pub machine_file: Option<Utf8PathBuf>,

    /// An address to hand to an instance. Repeat once per instance.
    #[clap(long, conflicts_with = "forward_ssh_port")]
    pub ip: Vec<IpAddr>,

    /// Reach each instance through its own forwarded SSH port on loopback.
    #[clap(long)]
    pub forward_ssh_port: bool,
}

#[derive(Args, Debug)]
pub struct DeployOptions {
    #[clap(flatten)]
    pub topology: TopologyOptions,

    /// The public key handed to deployed nodes. Defaults to the key named
    /// in nxc.toml, then to ~/.ssh/id_rsa.pub.
    #[clap(long, value_parser)]
    pub ssh_key: Option<Utf8PathBuf>,

    /// Base URL of the content server serving the environment directory.
    #[clap(long)]
    pub served_root: Option<String>,

    /// The user recorded in the deployment descriptor.
    #[clap(long, env = "USER")]
    pub user: String,

    /// The privilege-escalation command boot scripts default to.
    #[clap(long, env = "SUDO")]
    pub sudo: Option<String>,
}

#[derive(Args, Debug)]
pub struct DecodeOptions {
    /// The inline token, i.e. the value of deploy=.
    #[clap(required_unless_present = "cmdline")]
    pub token: Option<String>,

    /// A file holding a kernel command line, such as /proc/cmdline.
    #[clap(long, value_parser, conflicts_with = "token")]
    pub cmdline: Option<Utf8PathBuf>,
}

fn parse_role_quantity(s: &str) -> Result<(String, RoleQuantity), String> {
    let (role, quantity) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ROLE=QUANTITY, got {s:?}"))?;
    let role = role.trim();
    if role.is_empty() {
        return Err(format!("missing role in {s:?}"));
    }
    Ok((role.to_owned(), quantity.parse()?))
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        ProcessArgs::command().debug_assert();
    }

    #[test]
    fn role_quantities() {
        assert_eq!(
            parse_role_quantity("client=3"),
            Ok(("client".to_owned(), RoleQuantity::Count(3)))
        );
        assert_eq!(
            parse_role_quantity("server=web,api"),
            Ok((
                "server".to_owned(),
                RoleQuantity::Names(vec!["web".into(), "api".into()])
            ))
        );
        assert!(parse_role_quantity("client").is_err());
        assert!(parse_role_quantity("=3").is_err());
        assert!(parse_role_quantity("client=").is_err());
    }

    #[test]
    fn deploy_args() {
        let args = ProcessArgs::try_parse_from([
            "nxc",
            "deploy",
            "--envdir",
            "/env",
            "-c",
            "webserver",
            "-f",
            "vm-ramdisk",
            "-r",
            "client=2",
            "--forward-ssh-port",
            "--user",
            "alice",
        ])
        .unwrap();
        let Command::Deploy(opts) = args.command else {
            panic!("expected deploy");
        };
        assert_eq!(opts.topology.env.envdir, "/env");
        assert!(opts.topology.forward_ssh_port);
        assert_eq!(opts.topology.role_quantities.len(), 1);
        assert_eq!(opts.user, "alice");

        assert!(ProcessArgs::try_parse_from([
            "nxc",
            "topology",
            "-c",
            "webserver",
            "-f",
            "vm",
            "--ip",
            "10.0.0.1",
            "--forward-ssh-port",
        ])
        .is_err());
    }
}
