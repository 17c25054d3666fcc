use serde::{Deserialize, Serialize};

/// Operating system family of a pool's VM image. Decides the command
/// interpreter (bash vs PowerShell) and the container network driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    #[default]
    Linux,
    Windows,
}

impl std::fmt::Display for OsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// OS/architecture pair stamped onto every instance at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: OsKind,
    #[serde(default = "default_arch")]
    pub arch: String,
}

fn default_arch() -> String {
    "amd64".to_string()
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: OsKind::Linux,
            arch: default_arch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_platform() {
        let p = Platform::default();
        assert_eq!(p.os, OsKind::Linux);
        assert_eq!(p.arch, "amd64");
    }

    #[test]
    fn test_os_kind_display() {
        assert_eq!(OsKind::Linux.to_string(), "linux");
        assert_eq!(OsKind::Windows.to_string(), "windows");
    }

    #[test]
    fn test_platform_deserialize_defaults() {
        let p: Platform = serde_json::from_str("{}").unwrap();
        assert_eq!(p.os, OsKind::Linux);
        assert_eq!(p.arch, "amd64");
    }

    #[test]
    fn test_platform_deserialize_windows() {
        let p: Platform = serde_json::from_str(r#"{"os": "windows", "arch": "amd64"}"#).unwrap();
        assert_eq!(p.os, OsKind::Windows);
    }
}
