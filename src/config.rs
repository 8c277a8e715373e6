use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VbError;
use crate::paths;
use crate::util::{parse_bool, parse_size_mb};

/// Name of the master used when the config declares none.
pub const DEFAULT_MASTER: &str = "virtualbox";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub masters: BTreeMap<String, MasterConfig>,
    #[facet(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
    #[facet(default)]
    pub disks: BTreeMap<String, DiskConfig>,
    #[facet(default)]
    pub hostonlyifs: BTreeMap<String, HostOnlyIfConfig>,
    #[facet(default)]
    pub dhcpservers: BTreeMap<String, DhcpServerConfig>,
}

/// Settings shared by every instance driven through one `VBoxManage`.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct MasterConfig {
    #[facet(default = "VBoxManage")]
    pub executable: String,
    /// Run the tool on this host over ssh instead of locally.
    pub host: Option<String>,
    pub basefolder: Option<String>,
    pub headless: Option<bool>,
    pub use_acpi_powerbutton: Option<bool>,
    pub download_dir: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            executable: "VBoxManage".into(),
            host: None,
            basefolder: None,
            headless: None,
            use_acpi_powerbutton: None,
            download_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct InstanceConfig {
    pub master: Option<String>,
    pub basefolder: Option<String>,
    pub headless: Option<bool>,
    pub use_acpi_powerbutton: Option<bool>,
    #[facet(default)]
    pub no_terminate: bool,
    /// One attachment per line, e.g. `--type dvddrive --medium debian.iso`.
    #[facet(default)]
    pub storage: String,
    /// `modifyvm` flags without the leading `--`.
    #[facet(default)]
    pub vm: BTreeMap<String, String>,
    /// Storage controller name to extra `storagectl` flags.
    #[facet(default)]
    pub storagectl: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DiskConfig {
    /// Size in MB, or with a G/T suffix.
    pub size: Option<String>,
    #[facet(default = "VDI")]
    pub format: String,
    pub variant: Option<String>,
    /// Let `unregistervm --delete` remove the image on terminate.
    #[facet(default = true)]
    pub delete: bool,
    pub filename: Option<String>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            size: None,
            format: "VDI".into(),
            variant: None,
            delete: true,
            filename: None,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct HostOnlyIfConfig {
    pub ip: Option<String>,
    pub netmask: Option<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct DhcpServerConfig {
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub lowerip: Option<String>,
    pub upperip: Option<String>,
}

impl InstanceConfig {
    /// Apply `key=value` overrides given on the command line to a copy of
    /// this config.
    pub fn with_overrides(&self, overrides: &[(String, String)]) -> Result<Self, VbError> {
        let mut config = self.clone();
        for (key, value) in overrides {
            if let Some(flag) = key.strip_prefix("vm.") {
                validate_vm_key(flag)?;
                config.vm.insert(flag.to_string(), value.clone());
                continue;
            }
            if let Some(ctl) = key.strip_prefix("storagectl.") {
                config.storagectl.insert(ctl.to_string(), value.clone());
                continue;
            }
            match key.as_str() {
                "storage" => config.storage = value.clone(),
                "basefolder" => config.basefolder = Some(value.clone()),
                "headless" => config.headless = Some(parse_bool(value)?),
                "use_acpi_powerbutton" => config.use_acpi_powerbutton = Some(parse_bool(value)?),
                "no_terminate" => config.no_terminate = parse_bool(value)?,
                other => {
                    return Err(VbError::Validation {
                        message: format!("unknown override '{other}'"),
                    });
                }
            }
        }
        Ok(config)
    }
}

/// Parse a `key=value` override argument.
pub fn parse_override(s: &str) -> Result<(String, String), VbError> {
    let (key, value) = s.split_once('=').ok_or_else(|| VbError::Validation {
        message: format!("override must look like key=value (got '{s}')"),
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(VbError::Validation {
            message: format!("override has an empty key: '{s}'"),
        });
    }
    Ok((key.to_string(), value.to_string()))
}

// ── LoadedConfig ──────────────────────────────────────────

/// Parsed config plus the location it was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Canonicalized path to the config file.
    pub config_path: PathBuf,
    /// Directory relative paths in the config are resolved against.
    pub config_dir: PathBuf,
    pub config: Config,
}

impl LoadedConfig {
    pub fn instance(&self, name: &str) -> Result<&InstanceConfig, VbError> {
        self.config
            .instances
            .get(name)
            .ok_or_else(|| VbError::UnknownInstance { name: name.into() })
    }

    /// Names of all masters, including the implicit default one.
    pub fn master_names(&self) -> Vec<String> {
        if self.config.masters.is_empty() {
            vec![DEFAULT_MASTER.to_string()]
        } else {
            self.config.masters.keys().cloned().collect()
        }
    }

    /// Look up a master by name, falling back to defaults for the implicit one.
    pub fn master(&self, name: &str) -> Result<MasterConfig, VbError> {
        match self.config.masters.get(name) {
            Some(m) => Ok(m.clone()),
            None if self.config.masters.is_empty() && name == DEFAULT_MASTER => {
                Ok(MasterConfig::default())
            }
            None => Err(VbError::Validation {
                message: format!("no master '{name}' in config"),
            }),
        }
    }

    /// The master that drives `instance`.
    pub fn master_for(&self, instance: &str) -> Result<(String, MasterConfig), VbError> {
        let inst = self.instance(instance)?;
        let name = match &inst.master {
            Some(m) => m.clone(),
            None => self.default_master_name()?,
        };
        let master = self.master(&name)?;
        Ok((name, master))
    }

    /// The master to use when none is named: the only one configured.
    pub fn default_master_name(&self) -> Result<String, VbError> {
        let names = self.master_names();
        match names.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(VbError::Validation {
                message: format!(
                    "several masters are configured ({}), select one explicitly",
                    names.join(", ")
                ),
            }),
        }
    }

    /// Expand a path-valued setting relative to the config file.
    pub fn get_path(&self, value: &str) -> PathBuf {
        paths::expand_path(value, &self.config_dir)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VbError> {
    for name in config.masters.keys() {
        validate_name("master", name)?;
    }

    for (name, inst) in &config.instances {
        validate_name("instance", name)?;

        match &inst.master {
            Some(m) if !config.masters.is_empty() && !config.masters.contains_key(m) => {
                return Err(VbError::Validation {
                    message: format!("instance '{name}' refers to unknown master '{m}'"),
                });
            }
            Some(m) if config.masters.is_empty() && m != DEFAULT_MASTER => {
                return Err(VbError::Validation {
                    message: format!("instance '{name}' refers to unknown master '{m}'"),
                });
            }
            None if config.masters.len() > 1 => {
                return Err(VbError::Validation {
                    message: format!(
                        "instance '{name}' must name its master when several are configured"
                    ),
                });
            }
            _ => {}
        }

        for key in inst.vm.keys() {
            validate_vm_key(key)?;
        }
    }

    for (name, disk) in &config.disks {
        if disk.format.is_empty() {
            return Err(VbError::Validation {
                message: format!("disk '{name}' has an empty format"),
            });
        }
        if let Some(size) = &disk.size {
            parse_size_mb(size)?;
        }
    }

    Ok(())
}

fn validate_name(kind: &str, name: &str) -> Result<(), VbError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VbError::Validation {
            message: format!("{kind} name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

fn validate_vm_key(key: &str) -> Result<(), VbError> {
    if key.is_empty() || key.starts_with('-') || key.contains(char::is_whitespace) {
        return Err(VbError::Validation {
            message: format!("vm option must be a bare modifyvm flag name (got '{key}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, VbError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| VbError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<LoadedConfig, VbError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VbError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents, path)?;

    let canonical = path.canonicalize().map_err(|source| VbError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let config_dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(LoadedConfig {
        config_path: canonical,
        config_dir,
        config,
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn loaded(toml: &str) -> LoadedConfig {
        LoadedConfig {
            config_path: PathBuf::from("/etc/vbctl/vbctl.toml"),
            config_dir: PathBuf::from("/etc/vbctl"),
            config: parse_config(toml, Path::new("vbctl.toml")).unwrap(),
        }
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[masters.virtualbox]
basefolder = "vms"
headless = true

[instances.foo]
use_acpi_powerbutton = false
no_terminate = true
storage = """
--type dvddrive --medium ../debian.iso
--medium vb-disk:boot
"""

[instances.foo.vm]
ostype = "Debian_64"
nic1 = "hostonly"
hostonlyadapter1 = "vboxnet0"

[instances.foo.storagectl]
ide = "--add ide"

[disks.boot]
size = "102400"
delete = false

[hostonlyifs.vboxnet0]
ip = "192.168.56.1"

[dhcpservers.vboxnet0]
ip = "192.168.56.2"
netmask = "255.255.255.0"
lowerip = "192.168.56.100"
upperip = "192.168.56.254"
"#;
        let config = parse_config(toml, Path::new("vbctl.toml")).unwrap();
        let master = &config.masters["virtualbox"];
        assert_eq!(master.executable, "VBoxManage");
        assert_eq!(master.headless, Some(true));

        let foo = &config.instances["foo"];
        assert!(foo.no_terminate);
        assert_eq!(foo.use_acpi_powerbutton, Some(false));
        assert_eq!(foo.headless, None);
        assert_eq!(foo.vm["ostype"], "Debian_64");
        assert_eq!(foo.storagectl["ide"], "--add ide");
        assert_eq!(foo.storage.lines().filter(|l| !l.is_empty()).count(), 2);

        let boot = &config.disks["boot"];
        assert_eq!(boot.format, "VDI");
        assert!(!boot.delete);
        assert_eq!(config.dhcpservers["vboxnet0"].lowerip.as_deref(), Some("192.168.56.100"));
        assert_eq!(config.hostonlyifs["vboxnet0"].ip.as_deref(), Some("192.168.56.1"));
    }

    #[test]
    fn disk_defaults() {
        let config = parse_config("[disks.data]\nsize = \"10G\"\n", Path::new("x")).unwrap();
        let data = &config.disks["data"];
        assert_eq!(data.format, "VDI");
        assert!(data.delete);
        assert!(data.filename.is_none());
    }

    #[test]
    fn implicit_default_master() {
        let cfg = loaded("[instances.foo]\n");
        let (name, master) = cfg.master_for("foo").unwrap();
        assert_eq!(name, DEFAULT_MASTER);
        assert_eq!(master.executable, "VBoxManage");
        assert_eq!(cfg.master_names(), vec![DEFAULT_MASTER.to_string()]);
    }

    #[test]
    fn instance_picks_named_master() {
        let cfg = loaded(
            r#"
[masters.local]
[masters.remote]
host = "admin@vmhost"

[instances.foo]
master = "remote"
"#,
        );
        let (name, master) = cfg.master_for("foo").unwrap();
        assert_eq!(name, "remote");
        assert_eq!(master.host.as_deref(), Some("admin@vmhost"));
        assert!(cfg.default_master_name().is_err());
    }

    #[test]
    fn unnamed_master_rejected_when_ambiguous() {
        let toml = "[masters.a]\n[masters.b]\n[instances.foo]\n";
        assert!(parse_config(toml, Path::new("x")).is_err());
    }

    #[test]
    fn unknown_master_rejected() {
        let toml = "[masters.a]\n[instances.foo]\nmaster = \"b\"\n";
        assert!(parse_config(toml, Path::new("x")).is_err());
        let toml = "[instances.foo]\nmaster = \"b\"\n";
        assert!(parse_config(toml, Path::new("x")).is_err());
    }

    #[test]
    fn invalid_instance_names() {
        for name in ["-bad", ".bad", "a/b", "\"hello world\""] {
            let toml = format!("[instances.{name}]\n");
            assert!(
                parse_config(&toml, Path::new("x")).is_err(),
                "expected instance name {name} to be rejected"
            );
        }
    }

    #[test]
    fn vm_keys_must_be_bare_flags() {
        let toml = "[instances.foo.vm]\n\"--memory\" = \"512\"\n";
        assert!(parse_config(toml, Path::new("x")).is_err());
    }

    #[test]
    fn bad_disk_size_rejected() {
        let toml = "[disks.boot]\nsize = \"lots\"\n";
        assert!(parse_config(toml, Path::new("x")).is_err());
    }

    #[test]
    fn unknown_instance_is_typed_error() {
        let cfg = loaded("[instances.foo]\n");
        assert!(matches!(
            cfg.instance("bar"),
            Err(VbError::UnknownInstance { .. })
        ));
    }

    #[test]
    fn overrides_apply_to_copy() {
        let cfg = loaded("[instances.foo.vm]\nmemory = \"512\"\n");
        let foo = cfg.instance("foo").unwrap();
        let overridden = foo
            .with_overrides(&[
                ("vm.memory".into(), "1024".into()),
                ("headless".into(), "yes".into()),
                ("storagectl.sata".into(), "--add sata".into()),
            ])
            .unwrap();
        assert_eq!(overridden.vm["memory"], "1024");
        assert_eq!(overridden.headless, Some(true));
        assert_eq!(overridden.storagectl["sata"], "--add sata");
        assert_eq!(foo.vm["memory"], "512");
    }

    #[test]
    fn unknown_override_rejected() {
        let foo = InstanceConfig::default();
        assert!(foo.with_overrides(&[("colour".into(), "red".into())]).is_err());
    }

    #[test]
    fn parse_override_splits_on_first_equals() {
        assert_eq!(
            parse_override("vm.natpf1=ssh,tcp,,2222,,22").unwrap(),
            ("vm.natpf1".to_string(), "ssh,tcp,,2222,,22".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=x").is_err());
    }

    #[test]
    fn get_path_is_relative_to_config_dir() {
        let cfg = loaded("");
        assert_eq!(cfg.get_path("isos/a.iso"), PathBuf::from("/etc/vbctl/isos/a.iso"));
    }

    #[test]
    fn load_config_records_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vbctl.toml");
        std::fs::write(&path, "[instances.foo]\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.config_dir, dir.path().canonicalize().unwrap());
        assert!(cfg.instance("foo").is_ok());
    }

    #[test]
    fn load_config_missing_file() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/vbctl.toml")),
            Err(VbError::ConfigLoad { .. })
        ));
    }
}
