//! Typed share settings loaded from `smbvfs.conf`.
//!
//! ```text
//! [global]
//!     oplocks = yes
//!     xattr list max = 65536
//!     log level = info
//!
//! [public]
//!     path = /srv/public
//!     read only = no
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::ini::IniFile;

/// Linux XATTR_LIST_MAX.
pub const DEFAULT_XATTR_LIST_MAX: usize = 65536;

/// Settings that apply to every share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSettings {
    /// Whether the lease (oplock) subsystem is active. Also selects which
    /// locking path a handle-based truncate takes.
    pub oplocks: bool,
    /// Upper bound for listxattr buffers.
    pub xattr_list_max: usize,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        GlobalSettings {
            oplocks: true,
            xattr_list_max: DEFAULT_XATTR_LIST_MAX,
            log_level: "info".to_string(),
        }
    }
}

/// One exported share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSettings {
    pub name: String,
    pub path: PathBuf,
    pub read_only: bool,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub global: GlobalSettings,
    pub shares: Vec<ShareSettings>,
}

impl Settings {
    /// Load from an explicit path, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        let ini = IniFile::read(&path)?;
        Self::from_ini(&ini).with_context(|| format!("Invalid config {:?}", path))
    }

    /// Build typed settings from a parsed file.
    pub fn from_ini(ini: &IniFile) -> anyhow::Result<Self> {
        let defaults = GlobalSettings::default();
        let global = GlobalSettings {
            oplocks: ini.get_bool("global", "oplocks")?.unwrap_or(defaults.oplocks),
            xattr_list_max: ini
                .get_u64("global", "xattr list max")?
                .map(|v| v as usize)
                .unwrap_or(defaults.xattr_list_max),
            log_level: ini
                .get("global", "log level")
                .map(ToString::to_string)
                .unwrap_or(defaults.log_level),
        };

        if global.xattr_list_max == 0 {
            anyhow::bail!("xattr list max must be greater than zero");
        }

        let mut shares = Vec::new();
        for name in ini.share_names() {
            let path = ini
                .get(name, "path")
                .with_context(|| format!("Share [{}] has no path", name))?;
            shares.push(ShareSettings {
                name: name.to_string(),
                path: PathBuf::from(path),
                read_only: ini.get_bool(name, "read only")?.unwrap_or(false),
            });
        }

        Ok(Settings { global, shares })
    }

    /// Look up a share by name (case-insensitive, like share names on the wire).
    pub fn share(&self, name: &str) -> Option<&ShareSettings> {
        self.shares.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// `~/.config/smbvfs/smbvfs.conf`
    pub fn default_path() -> anyhow::Result<PathBuf> {
        config_file_in(dirs::config_dir(), dirs::home_dir())
    }
}

/// The config file under the platform config dir, else under `$HOME/.config`.
fn config_file_in(config_dir: Option<PathBuf>, home: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = config_dir
        .or_else(|| home.map(|home| home.join(".config")))
        .context("No config or home directory; pass the config file explicitly")?;
    Ok(dir.join("smbvfs").join("smbvfs.conf"))
}
