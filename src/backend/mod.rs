pub mod virtualbox;


use crate::config::LoadedConfig;
use crate::error::VbError;
use crate::prompt::Prompter;
use crate::status::VmStatus;
use crate::vbox::transport::Executor;

/// What `start` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Nothing to do: the VM is not in a state `start` brings up.
    AlreadyStarted(VmStatus),
    /// A saved VM was started without reconfiguring it.
    Resumed,
    Started { created: bool },
}

/// What `stop` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Unavailable,
    /// The VM wasn't running, so it was not stopped.
    NotRunning(VmStatus),
    /// The guest shut down after the ACPI power button.
    AcpiStopped,
    PoweredOff,
}

/// What `terminate` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The instance is configured with `no_terminate`.
    Refused,
    Unavailable,
    Terminated,
}

/// Guest address of one network adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// 1-based adapter number, as in `nic1`.
    pub nic: usize,
    /// Attachment type, e.g. `hostonly` or `bridged`.
    pub kind: String,
    pub ip: String,
}

/// Where to reach the guest's ssh port through a NAT port forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: VmStatus,
    /// Only filled in for running VMs; adapters without a reported address
    /// are left out.
    pub interfaces: Vec<InterfaceAddress>,
    pub ssh: Option<SshEndpoint>,
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Backend {
    async fn status(&self, name: &str) -> Result<StatusReport, VbError>;
    async fn start(
        &self,
        name: &str,
        overrides: &[(String, String)],
    ) -> Result<StartOutcome, VbError>;
    async fn stop(&self, name: &str) -> Result<StopOutcome, VbError>;
    async fn terminate(&self, name: &str) -> Result<TerminateOutcome, VbError>;
}

/// Backend for the master named `master`, talking to its `VBoxManage`
/// locally or over ssh.
pub fn create_backend<'a>(
    config: &'a LoadedConfig,
    master: &str,
    prompter: &'a dyn Prompter,
) -> Result<virtualbox::VirtualBoxBackend<'a, Executor>, VbError> {
    let master_config = config.master(master)?;
    let transport = Executor::new(&master_config.executable, master_config.host.as_deref());
    Ok(virtualbox::VirtualBoxBackend::new(
        transport,
        config,
        master,
        master_config,
        prompter,
    ))
}
