use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VbError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{message}")]
    #[diagnostic(help("{hint}"))]
    MissingSetting { message: String, hint: String },

    #[error("no instance '{name}' in config")]
    UnknownInstance { name: String },

    #[error("couldn't find [disks.{name}] referenced by instance '{instance}'")]
    UnknownDisk { name: String, instance: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with exit code {code:?}:\n{stderr}")]
    ExternalTool {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` produced unexpected {stream}:\n{output}")]
    UnexpectedOutput {
        command: String,
        stream: &'static str,
        output: String,
    },

    #[error("'{name}' is not a command of this VBoxManage")]
    #[diagnostic(help("run `vbctl commands` to see what the installed tool supports"))]
    UnknownCommand { name: String },

    #[error("don't know how to handle VM '{name}' in state '{state}'")]
    UnknownState { name: String, state: String },

    #[error("couldn't get status of '{name}'")]
    StatusUnavailable {
        name: String,
        #[source]
        source: Box<VbError>,
    },

    #[error("you have to select the controller for storage #{index} on VM '{name}'")]
    #[diagnostic(help("add --storagectl <name> to the storage line; available: {available}"))]
    AmbiguousController {
        name: String,
        index: usize,
        available: String,
    },

    #[error("{resource} '{name}' has {field} '{actual}' that doesn't match the config '{expected}'")]
    ResourceMismatch {
        resource: &'static str,
        name: String,
        field: &'static str,
        actual: String,
        expected: String,
    },

    #[error("the host only interface '{name}' doesn't exist and the next one to be created would be '{next}'")]
    #[diagnostic(help(
        "VBoxManage names new interfaces sequentially; fix the config or create the interface manually"
    ))]
    HostOnlyIfName { name: String, next: String },

    #[error("{message}")]
    Download {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("cancelled: {message}")]
    Cancelled { message: String },
}
