// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use hostctl_core::domain::host_config::HostConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./hostctl-config.yaml")]
        output: PathBuf,

        /// Generate a slave host configuration instead of a master one
        #[arg(long)]
        slave: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, slave } => generate(output, slave),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = HostConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. HOSTCTL_CONFIG_PATH: {}",
            std::env::var("HOSTCTL_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./hostctl-config.yaml");
        println!("  4. ~/.hostctl/config.yaml");
        println!("  5. /etc/hostctl/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Host:".bold());
    println!("  Name: {}", spec.host.name);
    println!("  Role: {}", if spec.host.master { "master" } else { "slave" });
    println!("  Running mode: {}", spec.host.running_mode);
    if let Some(path) = &spec.host.domain_model_path {
        println!("  Domain model: {}", path.display());
    }
    if spec.host.use_cached_domain_model {
        println!("  Uses cached domain model");
    }
    println!();

    if let Some(dc) = &spec.domain_controller {
        println!("{}", "Domain Controller:".bold());
        println!("  Address: {}", dc.address);
        println!("  Register timeout: {:?}", dc.register_timeout);
        if let Some(interval) = dc.heartbeat_interval {
            println!("  Heartbeat interval: {:?}", interval);
        }
        println!();
    }

    println!("{}", "Process Controller:".bold());
    println!("  Address: {}", spec.process_controller.address);
    println!();

    let m = &spec.management;
    println!("{}", "Management:".bold());
    println!("  Server back-channel: {}:{}", m.bind_address, m.server_port);
    if spec.host.master {
        println!("  Slave registration: {}:{}", m.bind_address, m.registration_port);
    }
    println!("  API: {}:{}", m.bind_address, m.api_port);
    println!();

    println!("{}", "Inventory:".bold());
    println!("  Inventory timeout: {:?}", spec.inventory.inventory_timeout);
    println!("  Stop timeout: {:?}", spec.inventory.stop_timeout);
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = HostConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, slave: bool) -> Result<()> {
    let sample = if slave {
        include_str!("../../templates/config-slave.yaml")
    } else {
        include_str!("../../templates/config-master.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{} {}", "✓ Configuration written to".green(), output.display());
    Ok(())
}
