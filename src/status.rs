//! Lifecycle state of a VM as reported by the tool.
//!
//! Nothing is stored: every query cross-references the VM collection with
//! the VM's detail record.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::VbError;
use crate::vbox::Gateway;
use crate::vbox::transport::Transport;

/// Delay before the single retry of a failed detail query.
const DETAIL_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// Not registered with the tool.
    Unavailable,
    Stopped,
    /// Running or in the middle of stopping.
    Running,
    /// Suspended to disk, e.g. by a host shutdown.
    Saved,
    /// The VM process died.
    Aborted,
}

impl VmStatus {
    /// States `start` can bring up.
    pub fn is_startable(self) -> bool {
        matches!(self, VmStatus::Stopped | VmStatus::Saved | VmStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Unavailable => "unavailable",
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
            VmStatus::Saved => "saved",
            VmStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map the detail record's `VMState` value.
pub fn map_vm_state(name: &str, state: &str) -> Result<VmStatus, VbError> {
    match state {
        "running" | "stopping" => Ok(VmStatus::Running),
        "poweroff" => Ok(VmStatus::Stopped),
        "saved" => Ok(VmStatus::Saved),
        "aborted" => {
            tracing::warn!(vm = name, state, "instance is in state '{state}'");
            Ok(VmStatus::Aborted)
        }
        other => Err(VbError::UnknownState {
            name: name.into(),
            state: other.into(),
        }),
    }
}

/// Resolve the status of `name`. Pass `vms` to reuse a collection listing
/// fetched by the caller.
pub async fn resolve<T: Transport>(
    gateway: &Gateway<T>,
    name: &str,
    vms: Option<&BTreeMap<String, String>>,
) -> Result<VmStatus, VbError> {
    let fetched;
    let vms = match vms {
        Some(vms) => vms,
        None => {
            fetched = gateway.list_vms().await?;
            &fetched
        }
    };
    if !vms.contains_key(name) {
        return Ok(VmStatus::Unavailable);
    }

    let info = match gateway.showvminfo(name).await {
        Ok(info) => info,
        Err(first) if is_transient(&first) => {
            tracing::debug!(vm = name, error = %first, "detail query failed, retrying once");
            tokio::time::sleep(DETAIL_RETRY_DELAY).await;
            gateway
                .showvminfo(name)
                .await
                .map_err(|e| VbError::StatusUnavailable {
                    name: name.into(),
                    source: Box::new(e),
                })?
        }
        Err(e) => return Err(e),
    };

    let state = info.get("VMState").map(String::as_str).unwrap_or_default();
    map_vm_state(name, state)
}

fn is_transient(e: &VbError) -> bool {
    matches!(
        e,
        VbError::ExternalTool { .. } | VbError::UnexpectedOutput { .. } | VbError::Io { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbox::testing::{MockTransport, VmInfo};

    #[test]
    fn state_mapping() {
        assert_eq!(map_vm_state("foo", "running").unwrap(), VmStatus::Running);
        assert_eq!(map_vm_state("foo", "stopping").unwrap(), VmStatus::Running);
        assert_eq!(map_vm_state("foo", "poweroff").unwrap(), VmStatus::Stopped);
        assert_eq!(map_vm_state("foo", "saved").unwrap(), VmStatus::Saved);
        assert_eq!(map_vm_state("foo", "aborted").unwrap(), VmStatus::Aborted);
    }

    #[test]
    fn unknown_state_is_an_error() {
        let err = map_vm_state("foo", "teleporting").unwrap_err();
        assert!(matches!(err, VbError::UnknownState { ref state, .. } if state == "teleporting"));
    }

    #[test]
    fn startable_states() {
        assert!(VmStatus::Stopped.is_startable());
        assert!(VmStatus::Saved.is_startable());
        assert!(VmStatus::Aborted.is_startable());
        assert!(!VmStatus::Running.is_startable());
        assert!(!VmStatus::Unavailable.is_startable());
    }

    #[tokio::test]
    async fn absent_vm_is_unavailable_without_detail_query() {
        let mock = MockTransport::new();
        mock.expect_vms(&["other"]);
        let gw = Gateway::new(mock.clone());
        assert_eq!(resolve(&gw, "foo", None).await.unwrap(), VmStatus::Unavailable);
        assert_eq!(mock.call_count(), 1);
        mock.assert_done();
    }

    #[tokio::test]
    async fn supplied_listing_is_reused() {
        let mock = MockTransport::new();
        mock.expect_vminfo("foo", &VmInfo::new().state("poweroff"));
        let gw = Gateway::new(mock.clone());
        let vms = BTreeMap::from([("foo".to_string(), "uuid".to_string())]);
        assert_eq!(resolve(&gw, "foo", Some(&vms)).await.unwrap(), VmStatus::Stopped);
        mock.assert_done();
    }

    #[tokio::test(start_paused = true)]
    async fn detail_query_retried_once() {
        let mock = MockTransport::new();
        mock.expect_vms(&["foo"]);
        mock.expect(&["showvminfo", "--machinereadable", "foo"], 1, "", "locked");
        mock.expect_vminfo("foo", &VmInfo::new().state("running"));
        let gw = Gateway::new(mock.clone());
        assert_eq!(resolve(&gw, "foo", None).await.unwrap(), VmStatus::Running);
        mock.assert_done();
    }

    #[tokio::test(start_paused = true)]
    async fn second_detail_failure_is_fatal() {
        let mock = MockTransport::new();
        mock.expect_vms(&["foo"]);
        mock.expect(&["showvminfo", "--machinereadable", "foo"], 1, "", "locked");
        mock.expect(&["showvminfo", "--machinereadable", "foo"], 1, "", "still locked");
        let gw = Gateway::new(mock.clone());
        let err = resolve(&gw, "foo", None).await.unwrap_err();
        assert!(matches!(err, VbError::StatusUnavailable { .. }));
        mock.assert_done();
    }

    #[tokio::test]
    async fn missing_state_field_is_unknown() {
        let mock = MockTransport::new();
        mock.expect_vms(&["foo"]);
        mock.expect_vminfo("foo", &VmInfo::new());
        let gw = Gateway::new(mock.clone());
        assert!(matches!(
            resolve(&gw, "foo", None).await,
            Err(VbError::UnknownState { .. })
        ));
    }
}
