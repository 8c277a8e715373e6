//! Host-only interfaces and their DHCP servers.
//!
//! Both are host-wide resources shared by every VM on a master. They are
//! created when missing and compared against the config when present; live
//! settings are never changed without the operator's say-so.

use std::collections::BTreeMap;

use crate::config::{DhcpServerConfig, HostOnlyIfConfig, LoadedConfig};
use crate::error::VbError;
use crate::prompt::Prompter;
use crate::vbox::parse::Info;
use crate::vbox::transport::Transport;
use crate::vbox::{Flags, Gateway, flags};

/// Name `hostonlyif create` will pick next: the lowest free `vboxnetN`.
pub fn next_hostonlyif_name(existing: &BTreeMap<String, Info>) -> String {
    (0..)
        .map(|n| format!("vboxnet{n}"))
        .find(|name| !existing.contains_key(name))
        .unwrap_or_default()
}

/// Network name the tool gives the DHCP server of host-only interface `name`.
pub fn dhcp_netname(name: &str) -> String {
    format!("HostInterfaceNetworking-{name}")
}

/// Make sure host-only interface `name` exists and matches its
/// `[hostonlyifs.<name>]` section, then ensure its DHCP server if one is
/// configured.
pub async fn ensure_hostonlyif<T: Transport>(
    gateway: &Gateway<T>,
    name: &str,
    config: &LoadedConfig,
    prompter: &dyn Prompter,
) -> Result<(), VbError> {
    let wanted = config
        .config
        .hostonlyifs
        .get(name)
        .cloned()
        .unwrap_or_default();
    let existing = gateway.list_hostonlyifs().await?;

    match existing.get(name) {
        None => create_hostonlyif(gateway, name, &wanted, &existing).await?,
        Some(live) => check_hostonlyif(name, &wanted, live)?,
    }

    if let Some(dhcp) = config.config.dhcpservers.get(name) {
        ensure_dhcpserver(gateway, name, dhcp, prompter).await?;
    }
    Ok(())
}

async fn create_hostonlyif<T: Transport>(
    gateway: &Gateway<T>,
    name: &str,
    wanted: &HostOnlyIfConfig,
    existing: &BTreeMap<String, Info>,
) -> Result<(), VbError> {
    let next = next_hostonlyif_name(existing);
    if next != name {
        return Err(VbError::HostOnlyIfName {
            name: name.into(),
            next,
        });
    }

    let no_args: [&str; 0] = [];
    gateway.hostonlyif("create", &no_args, &Flags::new()).await?;
    if !gateway.list_hostonlyifs().await?.contains_key(name) {
        return Err(VbError::Validation {
            message: format!("host only interface '{name}' is missing after creating it"),
        });
    }
    tracing::info!(interface = name, "created host only interface");

    if let Some(ip) = &wanted.ip {
        let mut named = flags([("ip", ip.as_str())]);
        if let Some(netmask) = &wanted.netmask {
            named.insert("netmask".into(), netmask.clone());
        }
        gateway.hostonlyif("ipconfig", &[name], &named).await?;
    }
    Ok(())
}

fn check_hostonlyif(name: &str, wanted: &HostOnlyIfConfig, live: &Info) -> Result<(), VbError> {
    let checks = [
        ("IP", "IPAddress", wanted.ip.as_ref()),
        ("netmask", "NetworkMask", wanted.netmask.as_ref()),
    ];
    for (field, key, expected) in checks {
        let Some(expected) = expected else { continue };
        let actual = live.get(key).map(String::as_str).unwrap_or_default();
        if actual != expected {
            return Err(VbError::ResourceMismatch {
                resource: "host only interface",
                name: name.into(),
                field,
                actual: actual.into(),
                expected: expected.clone(),
            });
        }
    }
    Ok(())
}

/// `dhcpserver add|modify` flags. Every address is required.
fn dhcp_flags(name: &str, wanted: &DhcpServerConfig) -> Result<Flags, VbError> {
    let fields = [
        ("ip", &wanted.ip),
        ("netmask", &wanted.netmask),
        ("lowerip", &wanted.lowerip),
        ("upperip", &wanted.upperip),
    ];
    let mut named = flags([("netname", dhcp_netname(name))]);
    for (key, value) in fields {
        let value = value.as_ref().ok_or_else(|| VbError::MissingSetting {
            message: format!("the '{key}' option is required for dhcpserver '{name}'"),
            hint: format!("set `{key}` in [dhcpservers.{name}]"),
        })?;
        named.insert(key.into(), value.clone());
    }
    Ok(named)
}

/// Make sure the DHCP server of host-only interface `name` exists with the
/// configured addresses. A server that differs is only modified after the
/// operator confirms.
pub async fn ensure_dhcpserver<T: Transport>(
    gateway: &Gateway<T>,
    name: &str,
    wanted: &DhcpServerConfig,
    prompter: &dyn Prompter,
) -> Result<(), VbError> {
    let named = dhcp_flags(name, wanted)?;
    let netname = dhcp_netname(name);

    if !gateway.list_dhcpservers().await?.contains_key(&netname) {
        gateway.call("dhcpserver", &["add", "--enable"], &named).await?;
        tracing::info!(dhcpserver = name, "added dhcpserver");
    }

    let servers = gateway.list_dhcpservers().await?;
    let live = servers.get(&netname).ok_or_else(|| VbError::Validation {
        message: format!("dhcpserver '{name}' is missing after adding it"),
    })?;

    let checks = [
        ("IP", "ip"),
        ("NetworkMask", "netmask"),
        ("lowerIPAddress", "lowerip"),
        ("upperIPAddress", "upperip"),
    ];
    let mut matches = true;
    for (live_key, key) in checks {
        let actual = live.get(live_key).map(String::as_str).unwrap_or_default();
        let expected = &named[key];
        if actual != expected {
            tracing::error!(
                dhcpserver = name,
                field = live_key,
                actual,
                expected = %expected,
                "dhcpserver doesn't match the config"
            );
            matches = false;
        }
    }
    if matches {
        return Ok(());
    }

    let question = format!("Should the dhcpserver '{name}' be modified to match the config?");
    if !prompter.confirm(&question)? {
        return Err(VbError::Cancelled {
            message: format!("dhcpserver '{name}' left unchanged"),
        });
    }
    gateway
        .call("dhcpserver", &["modify", "--enable"], &named)
        .await?;
    tracing::info!(dhcpserver = name, "modified dhcpserver");
    Ok(())
}
