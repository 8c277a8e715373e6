use clap::Parser;

use vbctl::backend::{
    self, Backend, StartOutcome, StatusReport, StopOutcome, TerminateOutcome,
};
use vbctl::cli::{Cli, Command, OutputFormat};
use vbctl::config::{self, LoadedConfig};
use vbctl::error::VbError;
use vbctl::logging;
use vbctl::prompt::{AssumeYes, InquirePrompter, Prompter};
use vbctl::vbox::Flags;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let file_handle = logging::init(cli.verbose);

    let loaded = config::load_config(&cli.config)?;

    // Activate file logging for commands that change VMs
    if matches!(
        cli.command,
        Command::Start { .. } | Command::Stop { .. } | Command::Terminate { .. } | Command::Tool { .. }
    ) {
        let log_path = vbctl::paths::logs_dir().join(logging::LOG_FILE);
        if let Err(e) = file_handle.set_file(&log_path) {
            tracing::debug!(path = %log_path.display(), error = %e, "file logging unavailable");
        }
    }

    let prompter: Box<dyn Prompter> = if cli.yes {
        Box::new(AssumeYes)
    } else {
        Box::new(InquirePrompter)
    };
    let prompter = prompter.as_ref();

    match cli.command {
        Command::List => list_instances(&loaded),
        Command::Status { instance, output } => {
            let (master, _) = loaded.master_for(&instance)?;
            let backend = backend::create_backend(&loaded, &master, prompter)?;
            let report = backend.status(&instance).await?;
            print_status(&instance, &report, output);
        }
        Command::Start {
            instance,
            overrides,
        } => {
            let overrides = overrides
                .iter()
                .map(|o| config::parse_override(o))
                .collect::<Result<Vec<_>, _>>()?;
            let (master, _) = loaded.master_for(&instance)?;
            let backend = backend::create_backend(&loaded, &master, prompter)?;
            match backend.start(&instance, &overrides).await? {
                StartOutcome::AlreadyStarted(status) => {
                    println!("Instance '{instance}' already started ({status})")
                }
                StartOutcome::Resumed => println!("Instance '{instance}' resumed"),
                StartOutcome::Started { created: true } => {
                    println!("Instance '{instance}' created and started")
                }
                StartOutcome::Started { created: false } => {
                    println!("Instance '{instance}' started")
                }
            }
        }
        Command::Stop { instance } => {
            let (master, _) = loaded.master_for(&instance)?;
            let backend = backend::create_backend(&loaded, &master, prompter)?;
            match backend.stop(&instance).await? {
                StopOutcome::Unavailable => println!("Instance '{instance}' unavailable"),
                StopOutcome::NotRunning(status) => {
                    println!("Instance '{instance}' not stopped (state: {status})")
                }
                StopOutcome::AcpiStopped => println!("Instance '{instance}' stopped via ACPI"),
                StopOutcome::PoweredOff => println!("Instance '{instance}' powered off"),
            }
        }
        Command::Terminate { instance } => {
            let (master, _) = loaded.master_for(&instance)?;
            let protected = loaded.instance(&instance)?.no_terminate;
            if !protected {
                let question = format!("Terminate instance '{instance}' and delete its files?");
                if !prompter.confirm(&question)? {
                    return Err(VbError::Cancelled {
                        message: format!("instance '{instance}' not terminated"),
                    }
                    .into());
                }
            }
            let backend = backend::create_backend(&loaded, &master, prompter)?;
            match backend.terminate(&instance).await? {
                TerminateOutcome::Refused => {
                    eprintln!("Instance '{instance}' is configured not to be terminated.");
                    std::process::exit(1);
                }
                TerminateOutcome::Unavailable => println!("Instance '{instance}' unavailable"),
                TerminateOutcome::Terminated => println!("Instance '{instance}' terminated"),
            }
        }
        Command::Commands { master } => {
            let master = match master {
                Some(m) => m,
                None => loaded.default_master_name()?,
            };
            let backend = backend::create_backend(&loaded, &master, prompter)?;
            for command in backend.gateway().commands().await? {
                println!("{command}");
            }
        }
        Command::Tool {
            master,
            subcommand,
            args,
        } => {
            let master = match master {
                Some(m) => m,
                None => loaded.default_master_name()?,
            };
            let backend = backend::create_backend(&loaded, &master, prompter)?;
            let out = backend
                .gateway()
                .call(&subcommand, args.as_slice(), &Flags::new())
                .await?;
            for line in &out.stdout {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn list_instances(loaded: &LoadedConfig) {
    if loaded.config.instances.is_empty() {
        println!("No instances configured.");
        return;
    }
    for name in loaded.config.instances.keys() {
        let master = loaded
            .master_for(name)
            .map(|(m, _)| m)
            .unwrap_or_else(|_| "?".into());
        println!("{name}\t{master}");
    }
}

fn print_status(instance: &str, report: &StatusReport, output: OutputFormat) {
    match output {
        OutputFormat::Json => {
            let json = StatusJson {
                name: instance.to_string(),
                state: report.status.to_string(),
                interfaces: report
                    .interfaces
                    .iter()
                    .map(|i| InterfaceJson {
                        nic: i.nic as u32,
                        kind: i.kind.clone(),
                        ip: i.ip.clone(),
                    })
                    .collect(),
                ssh: report.ssh.as_ref().map(|s| format!("{}:{}", s.host, s.port)),
            };
            println!(
                "{}",
                facet_json::to_string(&json).expect("JSON serialization")
            );
        }
        OutputFormat::Plain => {
            println!("Instance '{instance}': {}", report.status);
            for iface in &report.interfaces {
                println!("  IP for {} interface: {}", iface.kind, iface.ip);
            }
            if let Some(ssh) = &report.ssh {
                println!("  SSH: {}:{}", ssh.host, ssh.port);
            }
        }
    }
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct StatusJson {
    name: String,
    state: String,
    interfaces: Vec<InterfaceJson>,
    ssh: Option<String>,
}

#[derive(facet::Facet)]
struct InterfaceJson {
    nic: u32,
    kind: String,
    ip: String,
}
