use std::path::{Path, PathBuf};

use crate::config::CutoverConfig;
use crate::constants::STATE_FILE;

pub fn state_path(config: &CutoverConfig) -> PathBuf {
    Path::new(&config.state_root).join(STATE_FILE)
}

pub fn lock_root(config: &CutoverConfig) -> PathBuf {
    Path::new(&config.state_root).join("locks")
}

pub fn staging_root(config: &CutoverConfig) -> PathBuf {
    Path::new(&config.state_root).join("staging")
}

pub fn backup_root(config: &CutoverConfig) -> PathBuf {
    PathBuf::from(&config.backup_root)
}

pub fn live_dir(config: &CutoverConfig) -> PathBuf {
    PathBuf::from(&config.release.live_dir)
}

/// Sibling of the live dir holding the replaced release until commit.
pub fn previous_dir(config: &CutoverConfig) -> PathBuf {
    sibling(&live_dir(config), "previous")
}

pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[test]
    fn previous_dir_sits_beside_live_dir() {
        let mut config = default_config();
        config.release.live_dir = "/srv/web/current".to_string();
        assert_eq!(previous_dir(&config), PathBuf::from("/srv/web/.current.previous"));
        assert_eq!(lock_root(&config), PathBuf::from("/var/lib/cutover/locks"));
    }
}
