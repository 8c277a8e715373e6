//! Command gateway for `VBoxManage`.
//!
//! Every interaction with the tool goes through [`Gateway::invoke`]:
//! positional arguments first, then `--key value` flags in sorted key order,
//! with the exit code and output streams checked against an [`Expect`].
//! A few sub-commands have typed wrappers that decode their output; any
//! other sub-command the installed tool documents can be reached through
//! [`Gateway::call`], which validates the name against the command table
//! read once from the tool's usage text.

pub mod parse;
#[cfg(test)]
pub mod testing;
pub mod transport;

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::OnceCell;

use crate::error::VbError;
use parse::{GuestProperty, Info};
use transport::{ExecOutput, Transport};

/// Named `--key value` arguments. Sorted iteration keeps the rendered
/// command line deterministic.
pub type Flags = BTreeMap<String, String>;

/// Build [`Flags`] from string pairs.
pub fn flags<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Flags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// What a successful invocation must look like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expect {
    pub code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Expect {
    /// Accept whatever the tool does.
    pub fn anything() -> Self {
        Self::default()
    }

    /// Exit code 0, output not checked.
    pub fn success() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    /// Exit code 0 and nothing on stderr.
    pub fn quiet() -> Self {
        Self {
            code: Some(0),
            stderr: Some(String::new()),
            ..Self::default()
        }
    }
}

/// Decoded result of a `list` query, shaped by the list subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// `vms`, `runningvms`: name to uuid.
    Vms(BTreeMap<String, String>),
    /// Block-style listings keyed by their identifying field.
    Blocks(BTreeMap<String, Info>),
    /// `systemproperties`: a single block.
    Properties(Info),
    /// Subjects without a dedicated decoder.
    Raw(Vec<String>),
}

/// Which decoder a `list` subject uses.
fn list_decoder(subject: &str) -> Option<&'static str> {
    match subject {
        "vms" | "runningvms" => Some("vms"),
        "hostonlyifs" | "bridgedifs" => Some("Name"),
        "dhcpservers" => Some("NetworkName"),
        "systemproperties" => Some("properties"),
        _ => None,
    }
}

pub struct Gateway<T> {
    transport: T,
    commands: OnceCell<BTreeSet<String>>,
}

impl<T: Transport> Gateway<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            commands: OnceCell::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `<tool> <subcommand> [positional..] [--key value..]` and check the
    /// result against `expect`.
    pub async fn invoke<S: AsRef<str>>(
        &self,
        subcommand: &str,
        positional: &[S],
        named: &Flags,
        expect: &Expect,
    ) -> Result<ExecOutput, VbError> {
        let mut args = Vec::with_capacity(1 + positional.len() + named.len() * 2);
        if !subcommand.is_empty() {
            args.push(subcommand.to_string());
        }
        args.extend(positional.iter().map(|a| a.as_ref().to_string()));
        for (key, value) in named {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }

        let out = self.transport.exec(&args).await?;
        let command = self.transport.describe(&args);

        if let Some(code) = expect.code
            && out.code != Some(code)
        {
            return Err(VbError::ExternalTool {
                command,
                code: out.code,
                stderr: out.stderr.join("\n"),
            });
        }
        check_stream(&command, "stdout", &out.stdout, expect.stdout.as_deref(), out.success())?;
        check_stream(&command, "stderr", &out.stderr, expect.stderr.as_deref(), out.success())?;

        Ok(out)
    }

    /// Sub-commands the installed tool documents. Read once per gateway.
    pub async fn commands(&self) -> Result<&BTreeSet<String>, VbError> {
        self.commands
            .get_or_try_init(|| async {
                let no_args: [&str; 0] = [];
                let out = self
                    .invoke("", &no_args, &Flags::new(), &Expect::quiet())
                    .await?;
                let commands = parse::parse_command_list(&out.stdout);
                tracing::debug!(count = commands.len(), "discovered VBoxManage commands");
                Ok::<_, VbError>(commands)
            })
            .await
    }

    pub async fn has_command(&self, name: &str) -> Result<bool, VbError> {
        Ok(self.commands().await?.contains(name))
    }

    /// Run any documented sub-command, expecting exit code 0 and a silent stderr.
    pub async fn call<S: AsRef<str>>(
        &self,
        name: &str,
        positional: &[S],
        named: &Flags,
    ) -> Result<ExecOutput, VbError> {
        if !self.has_command(name).await? {
            return Err(VbError::UnknownCommand { name: name.into() });
        }
        self.invoke(name, positional, named, &Expect::quiet()).await
    }

    // ── list ─────────────────────────────────────────────

    async fn list_output(&self, subject: &str) -> Result<Vec<String>, VbError> {
        let out = self
            .invoke("list", &[subject], &Flags::new(), &Expect::quiet())
            .await?;
        Ok(out.stdout)
    }

    /// `list <subject>`, decoded by the subject's handler.
    pub async fn list(&self, subject: &str) -> Result<Listing, VbError> {
        let lines = self.list_output(subject).await?;
        Ok(match list_decoder(subject) {
            Some("vms") => Listing::Vms(parse::parse_vm_list(&lines)),
            Some("properties") => Listing::Properties(parse::parse_key_values(':', &lines)),
            Some(key_field) => Listing::Blocks(parse::parse_blocks(key_field, &lines)),
            None => Listing::Raw(lines),
        })
    }

    pub async fn list_vms(&self) -> Result<BTreeMap<String, String>, VbError> {
        Ok(parse::parse_vm_list(&self.list_output("vms").await?))
    }

    pub async fn list_hostonlyifs(&self) -> Result<BTreeMap<String, Info>, VbError> {
        Ok(parse::parse_blocks("Name", &self.list_output("hostonlyifs").await?))
    }

    pub async fn list_dhcpservers(&self) -> Result<BTreeMap<String, Info>, VbError> {
        Ok(parse::parse_blocks("NetworkName", &self.list_output("dhcpservers").await?))
    }

    pub async fn list_systemproperties(&self) -> Result<Info, VbError> {
        Ok(parse::parse_key_values(':', &self.list_output("systemproperties").await?))
    }

    // ── specialized sub-commands ─────────────────────────

    /// Detail query for one VM.
    pub async fn showvminfo(&self, name: &str) -> Result<Info, VbError> {
        let out = self
            .invoke(
                "showvminfo",
                &["--machinereadable", name],
                &Flags::new(),
                &Expect::quiet(),
            )
            .await?;
        Ok(parse::parse_key_values('=', &out.stdout))
    }

    /// Detail query grouped by an indexed key prefix (see [`parse::group_by_prefix`]).
    pub async fn vminfo_group(
        &self,
        name: &str,
        prefix: &str,
        namekey: Option<&str>,
    ) -> Result<BTreeMap<String, Info>, VbError> {
        let info = self.showvminfo(name).await?;
        Ok(parse::group_by_prefix(&info, prefix, namekey))
    }

    pub async fn guestproperty_enumerate(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, GuestProperty>, VbError> {
        let out = self
            .invoke("guestproperty", &["enumerate", name], &Flags::new(), &Expect::quiet())
            .await?;
        Ok(parse::parse_guest_properties(&out.stdout))
    }

    /// `controlvm <name> <action>`. Only `poweroff` must succeed; other
    /// actions (such as `acpipowerbutton`) are fire-and-forget.
    pub async fn controlvm(&self, name: &str, action: &str) -> Result<ExecOutput, VbError> {
        let expect = match action {
            "poweroff" => Expect::success(),
            _ => Expect::anything(),
        };
        self.invoke("controlvm", &[name, action], &Flags::new(), &expect)
            .await
    }

    /// `createhd`; the tool reports progress on stderr.
    pub async fn createhd(&self, named: &Flags) -> Result<ExecOutput, VbError> {
        let no_args: [&str; 0] = [];
        self.invoke("createhd", &no_args, named, &Expect::success())
            .await
    }

    pub async fn unregistervm(&self, name: &str, delete: bool) -> Result<ExecOutput, VbError> {
        let mut positional = vec![name];
        if delete {
            positional.push("--delete");
        }
        self.invoke("unregistervm", positional.as_slice(), &Flags::new(), &Expect::success())
            .await
    }

    pub async fn hostonlyif<S: AsRef<str>>(
        &self,
        action: &str,
        positional: &[S],
        named: &Flags,
    ) -> Result<ExecOutput, VbError> {
        let mut args = vec![action.to_string()];
        args.extend(positional.iter().map(|a| a.as_ref().to_string()));
        self.invoke("hostonlyif", args.as_slice(), named, &Expect::success())
            .await
    }
}

fn check_stream(
    command: &str,
    stream: &'static str,
    lines: &[String],
    expected: Option<&str>,
    exited_ok: bool,
) -> Result<(), VbError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = lines.join("\n");
    if actual.trim_end() == expected {
        return Ok(());
    }
    if exited_ok {
        tracing::error!(%command, %stream, output = %actual, "unexpected output from successful command");
    }
    Err(VbError::UnexpectedOutput {
        command: command.to_string(),
        stream,
        output: actual,
    })
}
