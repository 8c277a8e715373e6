use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::ProgressBar;
use tokio::sync::OnceCell;
use tracing::Instrument;

use super::{
    Backend, InterfaceAddress, SshEndpoint, StartOutcome, StatusReport, StopOutcome,
    TerminateOutcome,
};
use crate::config::{InstanceConfig, LoadedConfig, MasterConfig};
use crate::error::VbError;
use crate::prompt::Prompter;
use crate::status::{self, VmStatus};
use crate::storage::{self, Attachment, Medium};
use crate::vbox::parse::{self, Info};
use crate::vbox::transport::Transport;
use crate::vbox::{Flags, Gateway};
use crate::{disk, download, network, paths};

/// Interval between status polls while waiting for a VM to stop.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Status polls after the ACPI power button before forcing a poweroff.
const ACPI_POLLS: u32 = 60;

const DEFAULT_OSTYPE: &str = "Other";

/// Facts derived once per operation and shared by its steps.
struct Operation<'n> {
    name: &'n str,
    instance: InstanceConfig,
    basefolder: OnceCell<PathBuf>,
}

impl<'n> Operation<'n> {
    fn new(name: &'n str, instance: InstanceConfig) -> Self {
        Self {
            name,
            instance,
            basefolder: OnceCell::new(),
        }
    }
}

/// Lifecycle controller for the instances of one master.
pub struct VirtualBoxBackend<'a, T> {
    gateway: Gateway<T>,
    config: &'a LoadedConfig,
    master_name: String,
    master: MasterConfig,
    prompter: &'a dyn Prompter,
    span: tracing::Span,
}

impl<'a, T: Transport> VirtualBoxBackend<'a, T> {
    pub fn new(
        transport: T,
        config: &'a LoadedConfig,
        master_name: &str,
        master: MasterConfig,
        prompter: &'a dyn Prompter,
    ) -> Self {
        Self {
            gateway: Gateway::new(transport),
            config,
            master_name: master_name.to_string(),
            span: tracing::info_span!("vbox", master = master_name),
            master,
            prompter,
        }
    }

    pub fn gateway(&self) -> &Gateway<T> {
        &self.gateway
    }

    fn op_span(&self, op: &'static str, name: &str) -> tracing::Span {
        tracing::info_span!(parent: &self.span, "op", op, instance = name)
    }

    /// Config of `name`, which must be driven by this master.
    fn instance_config(&self, name: &str) -> Result<&'a InstanceConfig, VbError> {
        let config: &'a LoadedConfig = self.config;
        let (master, _) = config.master_for(name)?;
        if master != self.master_name {
            return Err(VbError::Validation {
                message: format!(
                    "instance '{name}' belongs to master '{master}', not '{}'",
                    self.master_name
                ),
            });
        }
        config.instance(name)
    }

    // ── derived settings ─────────────────────────────────

    async fn basefolder<'o>(&self, op: &'o Operation<'_>) -> Result<&'o Path, VbError> {
        let folder = op
            .basefolder
            .get_or_try_init(|| self.resolve_basefolder(op.name, &op.instance))
            .await?;
        Ok(folder.as_path())
    }

    /// Instance setting, then master setting, then the tool's default
    /// machine folder.
    async fn resolve_basefolder(
        &self,
        name: &str,
        instance: &InstanceConfig,
    ) -> Result<PathBuf, VbError> {
        if let Some(folder) = instance.basefolder.as_ref().or(self.master.basefolder.as_ref()) {
            return Ok(self.config.get_path(folder));
        }
        let props = self.gateway.list_systemproperties().await?;
        match props.get("Default machine folder") {
            Some(folder) if !folder.is_empty() => Ok(PathBuf::from(folder)),
            _ => Err(VbError::MissingSetting {
                message: format!("no basefolder configured for VM '{name}'"),
                hint: format!(
                    "set `basefolder` in [instances.{name}] or [masters.{}]",
                    self.master_name
                ),
            }),
        }
    }

    async fn vmfolder(&self, op: &Operation<'_>) -> Result<PathBuf, VbError> {
        Ok(self.basefolder(op).await?.join(op.name))
    }

    fn headless(&self, instance: &InstanceConfig) -> bool {
        instance
            .headless
            .or(self.master.headless)
            .unwrap_or(false)
    }

    async fn use_acpi(&self, name: &str, instance: &InstanceConfig) -> Result<bool, VbError> {
        match instance.use_acpi_powerbutton.or(self.master.use_acpi_powerbutton) {
            Some(acpi) => Ok(acpi),
            None => {
                let info = self.gateway.showvminfo(name).await?;
                Ok(info
                    .get("acpi")
                    .is_some_and(|v| v.eq_ignore_ascii_case("on")))
            }
        }
    }

    fn download_dir(&self) -> PathBuf {
        match &self.master.download_dir {
            Some(dir) => self.config.get_path(dir),
            None => paths::download_dir(),
        }
    }

    // ── start steps ──────────────────────────────────────

    /// `modifyvm` arguments for the `vm` settings. Port forwards and
    /// host-only adapters only apply to a VM created in this run; host-only
    /// interfaces they name are ensured on the way.
    async fn modifyvm_args(&self, op: &Operation<'_>, created: bool) -> Result<Vec<String>, VbError> {
        let mut args = Vec::new();
        for (key, value) in &op.instance.vm {
            let live_network = key.starts_with("natpf") || key.starts_with("hostonlyadapter");
            if live_network && !created {
                tracing::debug!(key = %key, "skipping network setting of existing VM");
                continue;
            }
            if key.starts_with("hostonlyadapter") {
                network::ensure_hostonlyif(&self.gateway, value, self.config, self.prompter).await?;
            }

            if key.starts_with("uartmode") {
                if value == "disconnected" {
                    continue;
                }
                args.push(format!("--{key}"));
                match value.split_once(char::is_whitespace) {
                    Some((mode @ ("server" | "client" | "file"), target)) => {
                        args.push(mode.to_string());
                        args.push(self.config.get_path(target.trim()).display().to_string());
                    }
                    _ => args.push(self.config.get_path(value).display().to_string()),
                }
            } else if key.starts_with("uart") && value != "off" {
                args.push(format!("--{key}"));
                args.extend(value.split_whitespace().map(str::to_string));
            } else {
                args.push(format!("--{key}"));
                args.push(value.clone());
            }
        }
        Ok(args)
    }

    /// Detail record plus its storage controllers by name.
    async fn controllers(&self, name: &str) -> Result<(Info, BTreeMap<String, Info>), VbError> {
        let info = self.gateway.showvminfo(name).await?;
        let controllers = parse::group_by_prefix(&info, "storagecontroller", Some("name"));
        Ok((info, controllers))
    }

    /// Local path (or literal) the tool should attach for `medium`.
    async fn resolve_medium(&self, op: &Operation<'_>, medium: &Medium) -> Result<String, VbError> {
        match medium {
            Medium::Path(path) => Ok(path.display().to_string()),
            Medium::Literal(value) => Ok(value.clone()),
            Medium::Disk(disk_name) => {
                let disk_config =
                    self.config
                        .config
                        .disks
                        .get(disk_name)
                        .ok_or_else(|| VbError::UnknownDisk {
                            name: disk_name.clone(),
                            instance: op.name.into(),
                        })?;
                let vmfolder = self.vmfolder(op).await?;
                let path = disk::ensure_disk(&self.gateway, disk_name, disk_config, &vmfolder).await?;
                Ok(path.display().to_string())
            }
            Medium::Remote { url, sha256 } => {
                let path =
                    download::fetch_remote(url, sha256.as_deref(), &self.download_dir(), self.prompter)
                        .await?;
                Ok(path.display().to_string())
            }
        }
    }

    async fn startvm(&self, name: &str, instance: &InstanceConfig) -> Result<(), VbError> {
        let mut named = Flags::new();
        if self.headless(instance) {
            named.insert("type".into(), "headless".into());
        }
        tracing::info!("starting instance");
        self.gateway.call("startvm", &[name], &named).await?;
        Ok(())
    }

    async fn start_inner(
        &self,
        name: &str,
        overrides: &[(String, String)],
    ) -> Result<StartOutcome, VbError> {
        let instance = self.instance_config(name)?.with_overrides(overrides)?;
        let attachments = storage::parse_storage(&instance.storage, name, self.config)?;
        let op = Operation::new(name, instance);

        let mut status = status::resolve(&self.gateway, name, None).await?;
        let mut created = false;
        if status == VmStatus::Unavailable {
            tracing::info!("creating instance");
            let basefolder = self.basefolder(&op).await?.display().to_string();
            let ostype = op
                .instance
                .vm
                .get("ostype")
                .map(String::as_str)
                .unwrap_or(DEFAULT_OSTYPE);
            self.gateway
                .call(
                    "createvm",
                    &["--name", name, "--basefolder", basefolder.as_str(), "--ostype", ostype, "--register"],
                    &Flags::new(),
                )
                .await?;
            created = true;
            status = status::resolve(&self.gateway, name, None).await?;
        }

        if !status.is_startable() {
            tracing::info!(%status, "instance already started");
            return Ok(StartOutcome::AlreadyStarted(status));
        }
        if status == VmStatus::Saved {
            self.startvm(name, &op.instance).await?;
            return Ok(StartOutcome::Resumed);
        }

        // 1. Hardware settings
        let args = self.modifyvm_args(&op, created).await?;
        if !args.is_empty() {
            let mut positional = vec![name.to_string()];
            positional.extend(args);
            self.gateway
                .call("modifyvm", positional.as_slice(), &Flags::new())
                .await?;
        }

        // 2. Storage controllers
        let (_, existing) = self.controllers(name).await?;
        for (ctl, extra) in &op.instance.storagectl {
            if existing.contains_key(ctl) {
                continue;
            }
            let extra = shlex::split(extra).ok_or_else(|| VbError::Validation {
                message: format!("storagectl '{ctl}' of '{name}' has unbalanced quotes"),
            })?;
            let mut positional = vec![name.to_string(), "--name".into(), ctl.clone()];
            positional.extend(extra);
            self.gateway
                .call("storagectl", positional.as_slice(), &Flags::new())
                .await?;
            tracing::info!(controller = %ctl, "added storage controller");
        }
        let (mut info, mut controllers) = self.controllers(name).await?;
        if !attachments.is_empty() && controllers.is_empty() {
            tracing::info!("adding default 'sata' controller");
            self.gateway
                .call("storagectl", &[name, "--name", "sata", "--add", "sata"], &Flags::new())
                .await?;
            (info, controllers) = self.controllers(name).await?;
        }

        // 3. Attachments
        for attachment in &attachments {
            let mut named = storage::resolve_slot(name, attachment, &controllers)?;
            if let Some(medium) = &attachment.medium {
                let medium = self.resolve_medium(&op, medium).await?;
                if storage::is_attached(&info, &named, &medium) {
                    tracing::debug!(%medium, "medium already attached");
                    continue;
                }
                named.insert("medium".into(), medium);
            }
            self.gateway.call("storageattach", &[name], &named).await?;
        }

        // 4. Boot
        self.startvm(name, &op.instance).await?;
        tracing::info!("instance started");
        Ok(StartOutcome::Started { created })
    }

    // ── stop / terminate ─────────────────────────────────

    async fn stop_inner(&self, name: &str) -> Result<StopOutcome, VbError> {
        let instance = self.instance_config(name)?;
        let status = status::resolve(&self.gateway, name, None).await?;
        match status {
            VmStatus::Unavailable => {
                tracing::info!("instance unavailable");
                return Ok(StopOutcome::Unavailable);
            }
            VmStatus::Running => {}
            other => {
                tracing::info!(status = %other, "instance not stopped");
                return Ok(StopOutcome::NotRunning(other));
            }
        }

        tracing::info!("stopping instance");
        if self.use_acpi(name, instance).await? {
            tracing::info!("trying to stop instance with ACPI");
            self.gateway.controlvm(name, "acpipowerbutton").await?;
            let pb = ProgressBar::new(u64::from(ACPI_POLLS));
            for _ in 0..ACPI_POLLS {
                if status::resolve(&self.gateway, name, None).await? == VmStatus::Stopped {
                    pb.finish_and_clear();
                    tracing::info!("instance stopped");
                    return Ok(StopOutcome::AcpiStopped);
                }
                pb.inc(1);
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            pb.finish_and_clear();
            tracing::warn!(polls = ACPI_POLLS, "ACPI shutdown didn't finish in time");
        }

        tracing::info!("stopping instance by sending 'poweroff'");
        self.gateway.controlvm(name, "poweroff").await?;
        tracing::info!("instance stopped");
        Ok(StopOutcome::PoweredOff)
    }

    /// Detach managed disks that must survive `unregistervm --delete`.
    async fn detach_kept_disks(&self, name: &str, attachments: &[Attachment]) -> Result<(), VbError> {
        let kept: Vec<&Attachment> = attachments
            .iter()
            .filter(|a| {
                a.disk()
                    .and_then(|d| self.config.config.disks.get(d))
                    .is_some_and(|d| !d.delete)
            })
            .collect();
        if kept.is_empty() {
            return Ok(());
        }

        let (_, controllers) = self.controllers(name).await?;
        for attachment in kept {
            let mut named = storage::resolve_slot(name, attachment, &controllers)?;
            named.insert("medium".into(), "none".into());
            self.gateway.call("storageattach", &[name], &named).await?;
            tracing::info!(disk = attachment.disk(), "detached disk to keep it");
        }
        Ok(())
    }

    async fn terminate_inner(&self, name: &str) -> Result<TerminateOutcome, VbError> {
        let instance = self.instance_config(name)?;
        if instance.no_terminate {
            tracing::error!("instance is configured not to be terminated");
            return Ok(TerminateOutcome::Refused);
        }
        let attachments = storage::parse_storage(&instance.storage, name, self.config)?;

        let mut status = status::resolve(&self.gateway, name, None).await?;
        if status == VmStatus::Unavailable {
            tracing::info!("instance unavailable");
            return Ok(TerminateOutcome::Unavailable);
        }
        if status == VmStatus::Running {
            tracing::info!("stopping instance");
            self.gateway.controlvm(name, "poweroff").await?;
        }
        // Saved and aborted VMs can be unregistered as they are.
        if !matches!(status, VmStatus::Stopped | VmStatus::Saved | VmStatus::Aborted) {
            tracing::info!("waiting for instance to stop");
            let pb = ProgressBar::new_spinner();
            while status != VmStatus::Stopped {
                status = status::resolve(&self.gateway, name, None).await?;
                if status == VmStatus::Unavailable {
                    pb.finish_and_clear();
                    tracing::info!("instance disappeared while stopping");
                    return Ok(TerminateOutcome::Unavailable);
                }
                pb.tick();
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            pb.finish_and_clear();
        }

        self.detach_kept_disks(name, &attachments).await?;

        tracing::info!("terminating instance");
        self.gateway.unregistervm(name, true).await?;
        tracing::info!("instance terminated");
        Ok(TerminateOutcome::Terminated)
    }

    // ── status ───────────────────────────────────────────

    async fn status_inner(&self, name: &str) -> Result<StatusReport, VbError> {
        self.instance_config(name)?;
        let vms = self.gateway.list_vms().await?;
        let status = status::resolve(&self.gateway, name, Some(&vms)).await?;
        let mut report = StatusReport {
            status,
            interfaces: Vec::new(),
            ssh: None,
        };
        if status != VmStatus::Running {
            tracing::info!(%status, "instance state");
            return Ok(report);
        }

        let props = self.gateway.guestproperty_enumerate(name).await?;
        let info = self.gateway.showvminfo(name).await?;
        let mut nics: Vec<(usize, Info)> = parse::group_by_prefix(&info, "nic", None)
            .into_iter()
            .filter_map(|(index, nic)| Some((index.parse().ok()?, nic)))
            .collect();
        nics.sort_by_key(|(index, _)| *index);

        for (index, nic) in nics {
            let kind = nic.get("").map(String::as_str).unwrap_or("none");
            if index == 0 || matches!(kind, "none" | "nat") {
                continue;
            }
            let key = format!("/VirtualBox/GuestInfo/Net/{}/V4/IP", index - 1);
            let Some(prop) = props.get(&key).filter(|p| !p.value.is_empty()) else {
                continue;
            };
            tracing::info!(interface = kind, ip = %prop.value, "guest address");
            report.interfaces.push(InterfaceAddress {
                nic: index,
                kind: kind.to_string(),
                ip: prop.value.clone(),
            });
        }
        report.ssh = ssh_endpoint(&info);
        tracing::info!("instance running");
        Ok(report)
    }
}

/// The NAT port forward carrying ssh, from `Forwarding(N)` entries shaped
/// `name,proto,hostip,hostport,guestip,guestport`.
pub fn ssh_endpoint(info: &Info) -> Option<SshEndpoint> {
    let rule = info
        .iter()
        .filter(|(key, _)| key.starts_with("Forwarding"))
        .map(|(_, value)| value)
        .find(|value| value.contains("ssh"))?;
    let fields: Vec<&str> = rule.split(',').collect();
    let host = fields
        .get(2)
        .filter(|h| !h.is_empty())
        .copied()
        .unwrap_or("127.0.0.1");
    let port = fields
        .get(3)
        .and_then(|p| p.parse().ok())
        .unwrap_or(22);
    Some(SshEndpoint {
        host: host.to_string(),
        port,
    })
}

impl<T: Transport> Backend for VirtualBoxBackend<'_, T> {
    async fn status(&self, name: &str) -> Result<StatusReport, VbError> {
        self.status_inner(name)
            .instrument(self.op_span("status", name))
            .await
    }

    async fn start(
        &self,
        name: &str,
        overrides: &[(String, String)],
    ) -> Result<StartOutcome, VbError> {
        self.start_inner(name, overrides)
            .instrument(self.op_span("start", name))
            .await
    }

    async fn stop(&self, name: &str) -> Result<StopOutcome, VbError> {
        self.stop_inner(name)
            .instrument(self.op_span("stop", name))
            .await
    }

    async fn terminate(&self, name: &str) -> Result<TerminateOutcome, VbError> {
        self.terminate_inner(name)
            .instrument(self.op_span("terminate", name))
            .await
    }
}
