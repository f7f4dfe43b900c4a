//! CLI entry point for the egress runtime (ert).

use std::process::ExitCode;
use std::sync::Arc;

use egress_runtime::cli::{Cli, Commands};
use egress_runtime::config::{load_default_settings, load_settings};
use egress_runtime::docker::{BollardDockerClient, DockerClient};
use egress_runtime::manager::{EgressController, NetworkAttachment};
use egress_runtime::rules::RuleList;
use egress_runtime::utils::init_debug_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_debug_logging(cli.debug);

    // Load configuration
    let settings = match cli.get_settings_path() {
        Some(path) if path.exists() => match load_settings(&path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Error loading settings from {:?}: {}", path, e);
                return ExitCode::from(1);
            }
        },
        _ => match load_default_settings() {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Error loading default settings: {}", e);
                return ExitCode::from(1);
            }
        },
    };

    // Connect to the Docker daemon
    let docker = match BollardDockerClient::connect_local() {
        Ok(docker) => Arc::new(docker),
        Err(e) => {
            eprintln!("Failed to connect to Docker: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = docker.ping().await {
        eprintln!("Docker daemon unreachable: {}", e);
        return ExitCode::from(1);
    }

    let controller = EgressController::new(&settings, docker);

    match run(&controller, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(
    controller: &EgressController<BollardDockerClient>,
    command: Commands,
) -> egress_runtime::Result<()> {
    match command {
        Commands::Up { env, profile } => {
            let result = controller.provision(&env, &profile).await?;
            for warning in &result.warnings {
                eprintln!("Warning: {}", warning);
            }
            match result.attachment {
                NetworkAttachment::None => {
                    println!("{}: provisioned (airgapped, no network)", env);
                }
                NetworkAttachment::HostDefault => {
                    println!("{}: provisioned (unrestricted, default network)", env);
                }
                NetworkAttachment::Filtered { network_id, dns } => {
                    println!("{}: provisioned", env);
                    println!("  network: {}", network_id);
                    println!("  dns:     {}", dns);
                }
            }
        }
        Commands::Reload { env } => {
            controller.reconfigure(&env).await?;
            println!("{}: policy reloaded", env);
        }
        Commands::Down { env } => {
            controller.destroy(&env).await?;
            println!("{}: destroyed", env);
        }
        Commands::Allow { env, domain, remove } => {
            apply_rule(controller, &env, RuleList::Allow, &domain, remove).await?;
        }
        Commands::Block { env, domain, remove } => {
            apply_rule(controller, &env, RuleList::Block, &domain, remove).await?;
        }
        Commands::Check { env, hostname } => {
            let action = controller.evaluate(&env, &hostname)?;
            println!("{}: {} -> {}", env, hostname, action.as_str());
        }
        Commands::Rules { env } => {
            let allowed = controller.list_domains(&env, RuleList::Allow)?;
            let blocked = controller.list_domains(&env, RuleList::Block)?;
            println!("allow:");
            for domain in allowed {
                println!("  {}", domain);
            }
            println!("block:");
            for domain in blocked {
                println!("  {}", domain);
            }
        }
    }
    Ok(())
}

async fn apply_rule(
    controller: &EgressController<BollardDockerClient>,
    env: &str,
    list: RuleList,
    domain: &str,
    remove: bool,
) -> egress_runtime::Result<()> {
    let changed = if remove {
        controller.remove_domain(env, list, domain).await?
    } else {
        controller.add_domain(env, list, domain).await?
    };

    let verb = if remove { "removed from" } else { "added to" };
    if changed {
        println!(
            "{}: {} {} {} list (run 'ert reload {}' to apply)",
            env,
            domain,
            verb,
            list.label(),
            env
        );
    } else {
        println!("{}: no change", env);
    }
    Ok(())
}
