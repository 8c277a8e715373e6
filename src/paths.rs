use std::path::{Path, PathBuf};

/// Default download directory for remote media: `~/.cache/vbctl/downloads/`
pub fn download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vbctl")
        .join("downloads")
}

/// Log directory: `~/.local/share/vbctl/logs/`
pub fn logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vbctl")
        .join("logs")
}

/// Expand a configured path: `~` is the home directory, relative paths are
/// rooted at `base`, absolute paths are returned unchanged.
pub fn expand_path(value: &str, base: &Path) -> PathBuf {
    if value == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest);
    }
    let p = Path::new(value);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_base() {
        assert_eq!(
            expand_path("disks/a.vdi", Path::new("/etc/vbctl")),
            PathBuf::from("/etc/vbctl/disks/a.vdi")
        );
    }

    #[test]
    fn absolute_paths_are_kept() {
        assert_eq!(
            expand_path("/srv/a.iso", Path::new("/etc/vbctl")),
            PathBuf::from("/srv/a.iso")
        );
    }

    #[test]
    fn tilde_is_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_path("~/x.iso", Path::new("/etc")), home.join("x.iso"));
    }
}
