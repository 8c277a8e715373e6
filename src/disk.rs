use std::path::{Path, PathBuf};

use crate::config::DiskConfig;
use crate::error::VbError;
use crate::paths;
use crate::util::parse_size_mb;
use crate::vbox::Gateway;
use crate::vbox::transport::Transport;
use crate::vbox::{Flags, flags};

/// Where the image of managed disk `name` lives: the configured filename
/// (or the section name) with the format as extension, inside the VM folder.
pub fn disk_path(name: &str, disk: &DiskConfig, vmfolder: &Path) -> PathBuf {
    let mut filename = disk.filename.clone().unwrap_or_else(|| name.to_string());
    let ext = format!(".{}", disk.format.to_lowercase());
    if !filename.ends_with(&ext) {
        filename.push_str(&ext);
    }
    paths::expand_path(&filename, vmfolder)
}

/// `createhd` flags for a new image at `path`.
fn createhd_flags(name: &str, disk: &DiskConfig, path: &Path) -> Result<Flags, VbError> {
    let size = disk.size.as_deref().ok_or_else(|| VbError::MissingSetting {
        message: format!("no size for disk '{name}'"),
        hint: format!("set `size` in [disks.{name}], e.g. size = \"20G\""),
    })?;
    let mut named = flags([
        ("filename", path.display().to_string()),
        ("format", disk.format.clone()),
        ("size", parse_size_mb(size)?.to_string()),
    ]);
    if let Some(variant) = &disk.variant {
        named.insert("variant".into(), variant.clone());
    }
    Ok(named)
}

/// Return the image path of managed disk `name`, creating the image first
/// if it doesn't exist yet.
pub async fn ensure_disk<T: Transport>(
    gateway: &Gateway<T>,
    name: &str,
    disk: &DiskConfig,
    vmfolder: &Path,
) -> Result<PathBuf, VbError> {
    let path = disk_path(name, disk, vmfolder);
    let exists = tokio::fs::try_exists(&path)
        .await
        .map_err(|e| VbError::Io {
            context: format!("checking for disk image {}", path.display()),
            source: e,
        })?;
    if exists {
        tracing::debug!(disk = name, path = %path.display(), "disk image already exists");
        return Ok(path);
    }

    let named = createhd_flags(name, disk, &path)?;
    gateway.createhd(&named).await?;
    tracing::info!(disk = name, path = %path.display(), "created disk image");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbox::testing::MockTransport;

    fn disk(size: Option<&str>) -> DiskConfig {
        DiskConfig {
            size: size.map(str::to_string),
            ..DiskConfig::default()
        }
    }

    #[test]
    fn path_gets_format_extension_once() {
        let vmfolder = Path::new("/vms/foo");
        assert_eq!(
            disk_path("boot", &disk(None), vmfolder),
            PathBuf::from("/vms/foo/boot.vdi")
        );
        let named = DiskConfig {
            filename: Some("system.vdi".into()),
            ..disk(None)
        };
        assert_eq!(
            disk_path("boot", &named, vmfolder),
            PathBuf::from("/vms/foo/system.vdi")
        );
        let vmdk = DiskConfig {
            format: "VMDK".into(),
            filename: Some("/data/big".into()),
            ..disk(None)
        };
        assert_eq!(
            disk_path("boot", &vmdk, vmfolder),
            PathBuf::from("/data/big.vmdk")
        );
    }

    #[tokio::test]
    async fn creates_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.vdi");
        let mock = MockTransport::new();
        mock.expect(
            &[
                "createhd",
                "--filename",
                &path.display().to_string(),
                "--format",
                "VDI",
                "--size",
                "20480",
                "--variant",
                "Fixed",
            ],
            0,
            "",
            "0%...10%...100%",
        );
        let gw = Gateway::new(mock.clone());
        let cfg = DiskConfig {
            variant: Some("Fixed".into()),
            ..disk(Some("20G"))
        };
        assert_eq!(ensure_disk(&gw, "boot", &cfg, dir.path()).await.unwrap(), path);
        mock.assert_done();
    }

    #[tokio::test]
    async fn existing_image_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boot.vdi"), b"").unwrap();
        let mock = MockTransport::new();
        let gw = Gateway::new(mock.clone());
        ensure_disk(&gw, "boot", &disk(None), dir.path()).await.unwrap();
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_size_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let gw = Gateway::new(MockTransport::new());
        assert!(matches!(
            ensure_disk(&gw, "boot", &disk(None), dir.path()).await,
            Err(VbError::MissingSetting { .. })
        ));
    }
}
