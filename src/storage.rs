//! Storage attachments declared by an instance's `storage` setting.
//!
//! Each non-empty line is a shell-quoted list of `storageattach` flags,
//! e.g. `--type dvddrive --medium debian.iso`. The medium reference is
//! classified up front; controller and port are only filled in once the
//! VM's live controllers are known.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::LoadedConfig;
use crate::error::VbError;
use crate::vbox::Flags;
use crate::vbox::parse::Info;

/// Prefix of medium references naming a `[disks.<name>]` section.
pub const DISK_PREFIX: &str = "vb-disk:";

/// Flag carrying the expected SHA-256 of a remote medium. Consumed here,
/// never passed to the tool.
pub const CHECKSUM_FLAG: &str = "medium_sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Medium {
    /// A local file, already expanded relative to the config file.
    Path(PathBuf),
    /// A managed disk, by section name.
    Disk(String),
    /// An image to download before attaching.
    Remote {
        url: reqwest::Url,
        sha256: Option<String>,
    },
    /// Passed through untouched (`none`, `emptydrive`, a uuid, ...).
    Literal(String),
}

/// One line of the storage setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Position in the storage setting; the default port.
    pub index: usize,
    /// Every flag except `medium`.
    pub flags: Flags,
    pub medium: Option<Medium>,
}

impl Attachment {
    /// The managed disk this line attaches, if any.
    pub fn disk(&self) -> Option<&str> {
        match &self.medium {
            Some(Medium::Disk(name)) => Some(name),
            _ => None,
        }
    }
}

/// Classify a `--medium` value.
pub fn classify_medium(
    value: &str,
    sha256: Option<String>,
    instance: &str,
    config: &LoadedConfig,
) -> Result<Medium, VbError> {
    if let Ok(url) = reqwest::Url::parse(value)
        && url.host_str().is_some_and(|h| !h.is_empty())
    {
        return Ok(Medium::Remote { url, sha256 });
    }
    if value.contains('.') {
        return Ok(Medium::Path(config.get_path(value)));
    }
    if let Some(name) = value.strip_prefix(DISK_PREFIX) {
        if !config.config.disks.contains_key(name) {
            return Err(VbError::UnknownDisk {
                name: name.into(),
                instance: instance.into(),
            });
        }
        return Ok(Medium::Disk(name.to_string()));
    }
    Ok(Medium::Literal(value.to_string()))
}

/// Parse the storage setting of `instance` into attachments, in order.
pub fn parse_storage(
    spec: &str,
    instance: &str,
    config: &LoadedConfig,
) -> Result<Vec<Attachment>, VbError> {
    let lines = spec.lines().map(str::trim).filter(|l| !l.is_empty());
    let mut result = Vec::new();
    for (index, line) in lines.enumerate() {
        let words = shlex::split(line).ok_or_else(|| VbError::Validation {
            message: format!("storage line #{} of '{instance}' has unbalanced quotes", index + 1),
        })?;
        if words.len() % 2 != 0 {
            return Err(VbError::Validation {
                message: format!(
                    "storage line #{} of '{instance}' must be --flag value pairs: {line}",
                    index + 1
                ),
            });
        }

        let mut flags = Flags::new();
        for pair in words.chunks(2) {
            let key = pair[0].strip_prefix("--").ok_or_else(|| VbError::Validation {
                message: format!("expected a --flag in storage line #{}, got '{}'", index + 1, pair[0]),
            })?;
            flags.insert(key.to_string(), pair[1].clone());
        }

        let sha256 = flags.remove(CHECKSUM_FLAG);
        let medium = flags
            .remove("medium")
            .map(|m| classify_medium(&m, sha256, instance, config))
            .transpose()?;
        flags.entry("type".into()).or_insert_with(|| "hdd".into());

        result.push(Attachment {
            index,
            flags,
            medium,
        });
    }
    Ok(result)
}

/// Fill in `storagectl` and `port` for `attachment` from the VM's
/// controllers. A missing controller is only guessed when there is exactly one.
pub fn resolve_slot(
    vm: &str,
    attachment: &Attachment,
    controllers: &BTreeMap<String, Info>,
) -> Result<Flags, VbError> {
    let mut flags = attachment.flags.clone();
    if !flags.contains_key("storagectl") {
        let mut names = controllers.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => {
                flags.insert("storagectl".into(), only.clone());
            }
            _ => {
                return Err(VbError::AmbiguousController {
                    name: vm.into(),
                    index: attachment.index,
                    available: controllers.keys().cloned().collect::<Vec<_>>().join(", "),
                });
            }
        }
    }
    flags
        .entry("port".into())
        .or_insert_with(|| attachment.index.to_string());
    Ok(flags)
}

/// Whether the detail record already shows `medium` in the slot `flags` name.
pub fn is_attached(info: &Info, flags: &Flags, medium: &str) -> bool {
    let (Some(ctl), Some(port)) = (flags.get("storagectl"), flags.get("port")) else {
        return false;
    };
    let device = flags.get("device").map(String::as_str).unwrap_or("0");
    info.get(&format!("{ctl}-{port}-{device}"))
        .is_some_and(|current| current == medium)
}
