// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;

use std::collections::BTreeSet;
use std::net::{IpAddr, ToSocketAddrs};

use anyhow::{anyhow, Context};
use camino::Utf8Path;
use clap::Parser;
use config::{DecodeOptions, DeployOptions, ProcessArgs, TopologyOptions};
use nxc_config_toml::Config;
use nxc_deploy::boot_script::BootScriptGenerator;
use nxc_deploy::compose_info::ComposeInfo;
use nxc_deploy::descriptor::PublicKey;
use nxc_deploy::layout::EnvLayout;
use nxc_deploy::roles::{resolve, RoleQuantityRequest};
use nxc_deploy::store::StoreResolver;
use nxc_deploy::topology::{
    AllocationStrategy, Topology, FORWARD_BASE_ADDRESS, FORWARD_BASE_PORT,
    VM_BASE_ADDRESS,
};
use nxc_deploy::transport::{decode_cmdline, decode_inline, TransportPolicy};
use nxc_deploy::{Plan, PlanInputs};
use tracing::{debug, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

fn main() -> anyhow::Result<()> {
    let args = ProcessArgs::parse();
    set_tracing_subscriber(&args)?;
    debug!(?args);

    match &args.command {
        config::Command::Deploy(opts) => deploy(opts),
        config::Command::Topology(opts) => print_topology(opts),
        config::Command::Decode(opts) => decode(opts),
    }
}

fn set_tracing_subscriber(args: &ProcessArgs) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("nxc".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// What every command that plans a topology starts from.
struct Environment {
    layout: EnvLayout,
    config: Config,
    info: ComposeInfo,
    request: RoleQuantityRequest,
    strategy: AllocationStrategy,
}

impl Environment {
    fn load(opts: &TopologyOptions) -> anyhow::Result<Self> {
        let layout = opts.env.layout();
        let config_file = layout.config_file();
        let config = nxc_config_toml::parse_or_default(&config_file)
            .with_context(|| format!("failed to read {config_file}"))?;

        let info = ComposeInfo::from_path(
            &layout.compose_info_file(),
            Some(layout.composition()),
            layout.flavour(),
        )
        .context("failed to load compose info; has the composition been built?")?;

        let request = role_request(opts)?;
        let strategy = allocation_strategy(opts, &config)?;
        info!(strategy = %strategy.kind(), "allocation strategy");

        Ok(Self { layout, config, info, request, strategy })
    }
}

fn role_request(opts: &TopologyOptions) -> anyhow::Result<RoleQuantityRequest> {
    let Some(path) = &opts.roles_file else {
        return Ok(opts.role_quantities.iter().cloned().collect());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    let value: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("{path} is not valid JSON"))?;
    Ok(RoleQuantityRequest::from_json_value(&value)?)
}

fn allocation_strategy(
    opts: &TopologyOptions,
    config: &Config,
) -> anyhow::Result<AllocationStrategy> {
    let allocation = &config.allocation;
    if let Some(path) = &opts.machine_file {
        return Ok(AllocationStrategy::ExplicitAddresses(machine_addresses(
            path,
        )?));
    }
    if !opts.ip.is_empty() {
        return Ok(AllocationStrategy::ExplicitAddresses(opts.ip.clone()));
    }
    if opts.forward_ssh_port {
        return Ok(AllocationStrategy::ForwardedPorts {
            base_addr: allocation
                .forward_base_address
                .unwrap_or(FORWARD_BASE_ADDRESS),
            base_port: allocation.forward_base_port.unwrap_or(FORWARD_BASE_PORT),
        });
    }
    Ok(AllocationStrategy::VmLocal {
        base: allocation.vm_base_address.unwrap_or(VM_BASE_ADDRESS),
    })
}

/// Resolves the machines listed in `path`, skipping blank lines and repeated
/// machines.
fn machine_addresses(path: &Utf8Path) -> anyhow::Result<Vec<IpAddr>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read machine file {path}"))?;

    let mut seen = BTreeSet::new();
    let mut addrs = Vec::new();
    for host in contents.lines().map(str::trim).filter(|h| !h.is_empty()) {
        if !seen.insert(host) {
            continue;
        }
        let addr = resolve_host(host)?;
        debug!(%host, %addr, "resolved machine");
        addrs.push(addr);
    }
    Ok(addrs)
}

fn resolve_host(host: &str) -> anyhow::Result<IpAddr> {
    (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve machine '{host}'"))?
        .map(|sock_addr| sock_addr.ip())
        .next()
        .ok_or_else(|| anyhow!("failed to resolve machine '{}'", host))
}

fn public_key(opts: &DeployOptions, config: &Config) -> anyhow::Result<PublicKey> {
    let path = match opts.ssh_key.as_ref().or(config.ssh.public_key.as_ref()) {
        Some(path) => path.clone(),
        None => PublicKey::default_path()?,
    };
    PublicKey::from_path(&path)
        .with_context(|| format!("failed to load public key {path}"))
}

fn deploy(opts: &DeployOptions) -> anyhow::Result<()> {
    let env = Environment::load(&opts.topology)?;

    let mut policy = TransportPolicy::from_config(&env.config.transport);
    if let Some(root) = &opts.served_root {
        policy.served_root = root.clone();
    }

    let plan = Plan::build(&PlanInputs {
        layout: &env.layout,
        roles: env.info.roles(),
        shared_images: env.info.all(),
        request: &env.request,
        strategy: &env.strategy,
        policy: &policy,
        public_key: public_key(opts, &env.config)?,
        user: opts.user.clone(),
        composition: env.info.composition().map(str::to_owned),
    })
    .context("failed to plan deployment")?;

    let mut generator = BootScriptGenerator::from_config(
        env.layout.clone(),
        StoreResolver::from_config(&env.config.store),
        &env.config.kexec,
    );
    if let Some(sudo) = &opts.sudo {
        generator = generator.with_sudo(sudo.clone());
    }

    let written =
        plan.write(&generator).context("failed to write deployment")?;

    if let Some(param) = plan.forwarded_key_param() {
        info!(%param, "append to QEMU_KERNEL_PARAMS to hand the key to VMs");
    }

    println!("{}", written.descriptor);
    for script in &written.scripts {
        println!("{script}");
    }
    Ok(())
}

fn print_topology(opts: &TopologyOptions) -> anyhow::Result<()> {
    let env = Environment::load(opts)?;
    let resolved = resolve(env.info.roles(), &env.request)?;
    let topology = env.strategy.allocate(env.info.roles(), &resolved)?;
    print!("{}", format_topology(&topology));
    Ok(())
}

fn format_topology(topology: &Topology) -> String {
    let mut out = format!(
        "{:<22} {:<16} {:<16} {:<6}\n",
        "ADDRESS", "ROLE", "HOST", "VM"
    );
    for node in topology.iter() {
        let vm = node.vm_id.map(|id| id.to_string()).unwrap_or_default();
        out.push_str(&format!(
            "{:<22} {:<16} {:<16} {:<6}\n",
            node.key.to_string(),
            node.role,
            node.host,
            vm
        ));
    }
    out
}

fn decode(opts: &DecodeOptions) -> anyhow::Result<()> {
    let trimmed = match (&opts.token, &opts.cmdline) {
        (Some(token), _) => decode_inline(token)?,
        (None, Some(path)) => {
            let cmdline = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {path}"))?;
            decode_cmdline(&cmdline)?
        }
        (None, None) => anyhow::bail!("no token or command line given"),
    };
    println!("{}", serde_json::to_string_pretty(&trimmed)?);
    Ok(())
}
