use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vbctl", about = "VirtualBox VM lifecycle control via VBoxManage")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vbctl.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the state of an instance and its guest addresses
    Status {
        instance: String,

        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Create (if needed), configure and boot an instance
    Start {
        instance: String,

        /// Override a setting for this start, e.g. `-o vm.memory=2048`
        #[arg(short = 'o', long = "override", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Shut an instance down, via ACPI if enabled
    Stop { instance: String },

    /// Power off, unregister and delete an instance
    Terminate { instance: String },

    /// List configured instances
    List,

    /// Print the sub-commands the installed VBoxManage supports
    Commands {
        #[arg(long)]
        master: Option<String>,
    },

    /// Run a VBoxManage sub-command through the validated dispatch
    Tool {
        #[arg(long)]
        master: Option<String>,

        subcommand: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}
