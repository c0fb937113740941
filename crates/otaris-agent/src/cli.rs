//! Definition of the command line interface (CLI).

use std::path::PathBuf;

use clap::Parser;
use indoc::formatdoc;
use reportify::{ErrorExt, ResultExt};
use tracing::{info, warn};

use otaris_client::auth::AuthManager;
use otaris_client::deployments::DeploymentInstructions;
use otaris_client::identity::DeviceIdentity;
use otaris_client::inventory::InventoryItem;
use otaris_client::keystore::{Keystore, KeystoreError};
use otaris_client::{ApiClient, ClientError, ServerDescriptor, TlsOptions, UpdateInfo};
use otaris_common::cancel::CancelToken;
use otaris_common::store::Store;
use otaris_common::SystemResult;

use crate::config::{load_config, AgentConfig, DEFAULT_CONFIG_PATH};
use crate::installer::{InstallOptions, Installer, InstallOutcome};
use crate::system::System;

pub fn main() -> SystemResult<()> {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .event_format(format)
        .init();

    let args = Args::parse();
    let config = load_config(
        args.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    )?;
    match &args.command {
        Command::Authorize => {
            let mut client = build_client(&config)?;
            client.authorize().whatever("unable to authorize device")?;
            info!("device authorized with {}", client.servers()[client.active_server()].url);
        }
        Command::Check => {
            let mut client = build_client(&config)?;
            match client.check_update() {
                Ok(Some(instructions)) => print_instructions(&instructions),
                Ok(None) => println!("No update available."),
                Err(report) => {
                    if matches!(report.error(), ClientError::AlreadyInstalled) {
                        println!("Offered artifact is already installed.");
                    } else {
                        return Err(report).whatever("unable to check for updates");
                    }
                }
            }
        }
        Command::Install(install) => {
            let mut installer = build_installer(&config)?;
            let options = InstallOptions {
                delta: install.delta,
                rootfs_size: install.rootfs_size,
                progress: if install.progress {
                    Some(build_client(&config)?)
                } else {
                    None
                },
                progress_interval: config.progress_interval(),
            };
            let outcome = installer
                .check_and_install(options)
                .whatever("unable to install update")?;
            match outcome {
                InstallOutcome::NoUpdate => println!("No update available."),
                InstallOutcome::AlreadyInstalled => {
                    println!("Offered artifact is already installed.")
                }
                InstallOutcome::Installed => {
                    if install.no_reboot {
                        println!("Update installed; reboot the device to activate it.");
                    } else {
                        installer
                            .reboot_into_update()
                            .whatever("unable to reboot into the update")?;
                    }
                }
            }
        }
        Command::Commit => {
            let mut installer = build_installer(&config)?;
            installer.commit().whatever("unable to commit update")?;
            println!("Update committed.");
        }
        Command::Rollback => {
            let mut installer = build_installer(&config)?;
            installer
                .system_mut()
                .swap_partitions()
                .whatever("unable to swap partitions")?;
            println!("Boot partition swapped; reboot the device to activate it.");
        }
        Command::Inventory => {
            let mut client = build_client(&config)?;
            if !client
                .auth()
                .is_authorized(&client.servers()[client.active_server()])
            {
                client.authorize().whatever("unable to authorize device")?;
            }
            let items = inventory_items(&config, client.update_info());
            client
                .update_inventory(&items)
                .whatever("unable to push inventory")?;
            info!("inventory pushed ({} attributes)", items.len());
        }
        Command::Daemon => {
            run_daemon(&config)?;
        }
        Command::Show => {
            let system = build_system(&config)?;
            let active = system
                .active_partition()
                .map(str::to_owned)
                .unwrap_or_else(|_| "<unknown>".to_owned());
            let inactive = system
                .inactive_partition()
                .map(str::to_owned)
                .unwrap_or_else(|_| "<unknown>".to_owned());
            let pending = system.has_update().unwrap_or(false);
            print!(
                "{}",
                formatdoc! {"
                    Device type:        {device_type}
                    Installed artifact: {artifact_name}
                    Active partition:   {active}
                    Inactive partition: {inactive}
                    Pending update:     {pending}
                ",
                    device_type = config.device_type()?,
                    artifact_name = config.artifact_name()?,
                }
            );
        }
    }
    Ok(())
}

fn print_instructions(instructions: &DeploymentInstructions) {
    println!("Deployment {} is pending:", instructions.deployment_id);
    println!("  artifact: {}", instructions.artifact.artifact_name);
    println!(
        "  compatible device types: {}",
        instructions.artifact.device_types.join(", ")
    );
}

fn run_daemon(config: &AgentConfig) -> SystemResult<()> {
    let mut installer = build_installer(config)?;
    info!("update agent started");
    if installer.system().has_update().unwrap_or(false) {
        // First run after a reboot into a fresh update.
        if let Err(report) = installer.commit() {
            warn!("commit after reboot failed: {report:?}");
        }
    }
    loop {
        let wait = match installer.check_and_install(InstallOptions {
            progress_interval: config.progress_interval(),
            ..InstallOptions::default()
        }) {
            Ok(InstallOutcome::Installed) => {
                installer
                    .reboot_into_update()
                    .whatever("unable to reboot into the update")?;
                config.retry_poll_interval()
            }
            Ok(_) => config.update_poll_interval(),
            Err(report) => {
                warn!("update check failed: {report:?}");
                config.retry_poll_interval()
            }
        };
        std::thread::sleep(wait);
    }
}

fn inventory_items(config: &AgentConfig, update_info: &UpdateInfo) -> Vec<InventoryItem> {
    let mut items = vec![
        InventoryItem::new("device_type", &update_info.device_type),
        InventoryItem::new("artifact_name", &update_info.artifact_name),
    ];
    for (name, value) in &config.inventory {
        items.push(InventoryItem::new(name, value));
    }
    items
}

fn build_client(config: &AgentConfig) -> SystemResult<ApiClient> {
    let store = Store::open(config.data_dir())?;
    let mut keystore = Keystore::new(config.key_path());
    match keystore.load() {
        Ok(()) => {}
        Err(KeystoreError::NoKeys) => {
            info!("no device key found, generating one");
            keystore
                .generate(config.key_algorithm.into())
                .whatever("unable to generate device key")?;
            keystore.save().whatever("unable to save device key")?;
        }
        Err(error) => return Err(error.whatever("unable to load device key")),
    }

    let device_type = config.device_type()?;
    let artifact_name = config.artifact_name()?;
    let mut attributes = config.identity.clone();
    if attributes.is_empty() {
        attributes.insert("device_type".to_owned(), device_type.clone());
    }
    let identity =
        DeviceIdentity::from_attributes(&attributes).whatever("unable to build device identity")?;
    let auth = AuthManager::new(store, keystore, identity);

    let servers = config
        .servers
        .iter()
        .map(|server| {
            ServerDescriptor::new(
                &server.url,
                server
                    .tenant_token
                    .clone()
                    .or_else(|| config.tenant_token.clone())
                    .unwrap_or_default(),
            )
        })
        .collect();
    let tls = TlsOptions {
        server_cert: config.server_certificate.clone(),
        skip_verify: config.skip_verify,
    };
    ApiClient::new(
        servers,
        UpdateInfo {
            device_type,
            artifact_name,
        },
        auth,
        &tls,
    )
    .whatever("unable to initialize API client")
}

fn build_system(config: &AgentConfig) -> SystemResult<System> {
    let (part_a, part_b) = config.partitions()?;
    System::new(config.boot_env(), part_a, part_b).whatever("unable to initialize system")
}

fn build_installer(config: &AgentConfig) -> SystemResult<Installer> {
    let client = build_client(config)?;
    let system = build_system(config)?;
    let store = Store::open(config.data_dir())?;
    Ok(Installer::new(client, system, store, CancelToken::new()))
}

#[derive(Debug, Parser)]
#[clap(author, about)]
pub struct Args {
    /// Path to the agent configuration file.
    #[clap(long)]
    config: Option<PathBuf>,
    /// The command.
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Authenticate the device with the configured servers.
    Authorize,
    /// Check whether a deployment is pending.
    Check,
    /// Check for a pending deployment and install it.
    Install(InstallCommand),
    /// Confirm a freshly booted update, or roll back.
    Commit,
    /// Make the inactive partition the boot partition.
    Rollback,
    /// Push the device's inventory attributes to the server.
    Inventory,
    /// Poll for deployments and install them as they arrive.
    Daemon,
    /// Show the device's update state.
    Show,
}

#[derive(Debug, Parser)]
pub struct InstallCommand {
    /// Apply the artifact as a delta patch against the active partition.
    #[clap(long)]
    delta: bool,
    /// Size of the patched rootfs in bytes for delta installs.
    #[clap(long)]
    rootfs_size: Option<u64>,
    /// Do not reboot after a successful install.
    #[clap(long)]
    no_reboot: bool,
    /// Report install progress to the server in the background.
    #[clap(long)]
    progress: bool,
}
