// SPDX-License-Identifier: AGPL-3.0-or-later
//! Which keys the provisioner owns
//!
//! Base keys are tool-owned and take the computed default on every run.
//! Groups are operator-owned: once any member holds a real value the group is
//! kept as a unit and only replaced wholesale by [`super::apply_group`].

use std::path::Path;

pub const VPS_ENABLED: &str = "VPS_ENABLED";
pub const VPS_HOST: &str = "VPS_HOST";
pub const VPS_USER: &str = "VPS_USER";
pub const VPS_PORT: &str = "VPS_PORT";
pub const VPS_REMOTE_PATH: &str = "VPS_REMOTE_PATH";
pub const VPS_SSH_KEY_PATH: &str = "VPS_SSH_KEY_PATH";
pub const VPS_RSYNC_OPTIONS: &str = "VPS_RSYNC_OPTIONS";

pub const CAMERA_IP: &str = "CAMERA_IP";
pub const CAMERA_USERNAME: &str = "CAMERA_USERNAME";
pub const CAMERA_PASSWORD: &str = "CAMERA_PASSWORD";

pub const DOMAIN_NAME: &str = "DOMAIN_NAME";
pub const SSL_EMAIL: &str = "SSL_EMAIL";
pub const SECRET_KEY: &str = "SECRET_KEY";

pub const HOST: &str = "HOST";
pub const PORT: &str = "PORT";
pub const PRIMARY_IP: &str = "PRIMARY_IP";
pub const ENVIRONMENT: &str = "ENVIRONMENT";
pub const SEQUENCES_DIR: &str = "SEQUENCES_DIR";

/// Factory camera password the service refuses in production
pub const DEFAULT_CAMERA_PASSWORD: &str = "123456";

pub const DEFAULT_REMOTE_PATH: &str = "/var/www/html";
pub const DEFAULT_RSYNC_OPTIONS: &str = "-avz --delete";
pub const DEFAULT_SEQUENCES_DIR: &str = "/var/lib/imgserv/sequences";

/// A set of keys that is preserved or replaced as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedGroup {
    /// Short name used in logs
    pub name: &'static str,
    prefix: Option<&'static str>,
    keys: &'static [&'static str],
}

impl ManagedGroup {
    /// Group of every key starting with `prefix`
    pub const fn prefixed(name: &'static str, prefix: &'static str) -> Self {
        Self {
            name,
            prefix: Some(prefix),
            keys: &[],
        }
    }

    /// Group of an explicit key list
    pub const fn keyed(name: &'static str, keys: &'static [&'static str]) -> Self {
        Self {
            name,
            prefix: None,
            keys,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prefix.is_some_and(|p| key.starts_with(p)) || self.keys.contains(&key)
    }
}

pub const VPS_GROUP: ManagedGroup = ManagedGroup::prefixed("vps", "VPS_");
pub const CAMERA_GROUP: ManagedGroup = ManagedGroup::prefixed("camera", "CAMERA_");
pub const TLS_GROUP: ManagedGroup = ManagedGroup::keyed("tls", &[DOMAIN_NAME, SSL_EMAIL]);
pub const SECRET_GROUP: ManagedGroup = ManagedGroup::keyed("secret", &[SECRET_KEY]);

/// All operator-owned groups
pub const MANAGED_GROUPS: [ManagedGroup; 4] = [VPS_GROUP, CAMERA_GROUP, TLS_GROUP, SECRET_GROUP];

/// Tool-owned keys, overwritten with the computed default on every run
pub const BASE_KEYS: &[&str] = &[
    HOST,
    PORT,
    "LOG_LEVEL",
    ENVIRONMENT,
    "DATA_DIR",
    "IMAGES_DIR",
    SEQUENCES_DIR,
    "LOG_FILE",
];

const PLACEHOLDERS: &[&str] = &[
    "change_this_in_production",
    "changeme",
    "change_me",
    "your-vps-ip",
    "your-domain.com",
    "you@example.com",
];

/// Whether a value is empty or one of the template placeholders
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || PLACEHOLDERS.contains(&value.to_ascii_lowercase().as_str())
}

/// Computed defaults for one run, in the order new keys are appended
pub fn service_defaults(production: bool, key_path: &Path) -> Vec<(String, String)> {
    let environment = if production { "production" } else { "development" };
    let pairs: Vec<(&str, String)> = vec![
        (HOST, "0.0.0.0".to_string()),
        (PORT, "8080".to_string()),
        ("LOG_LEVEL", "INFO".to_string()),
        (ENVIRONMENT, environment.to_string()),
        ("DATA_DIR", "/var/lib/imgserv".to_string()),
        ("IMAGES_DIR", "/var/lib/imgserv/images".to_string()),
        (SEQUENCES_DIR, DEFAULT_SEQUENCES_DIR.to_string()),
        ("LOG_FILE", "/var/log/imgserv/app.log".to_string()),
        (SECRET_KEY, generate_secret()),
        (CAMERA_IP, "192.168.1.110".to_string()),
        (CAMERA_USERNAME, "admin".to_string()),
        (CAMERA_PASSWORD, DEFAULT_CAMERA_PASSWORD.to_string()),
        (VPS_USER, "root".to_string()),
        (VPS_PORT, "22".to_string()),
        (VPS_REMOTE_PATH, DEFAULT_REMOTE_PATH.to_string()),
        (VPS_SSH_KEY_PATH, key_path.display().to_string()),
        (VPS_RSYNC_OPTIONS, DEFAULT_RSYNC_OPTIONS.to_string()),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parse a boolean flag value; `None` when it is neither truthy nor falsy
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_membership() {
        assert!(VPS_GROUP.contains("VPS_HOST"));
        assert!(VPS_GROUP.contains("VPS_ANYTHING_NEW"));
        assert!(!VPS_GROUP.contains("HOST"));
        assert!(TLS_GROUP.contains("DOMAIN_NAME"));
        assert!(!TLS_GROUP.contains("DOMAIN"));
    }

    #[test]
    fn test_placeholders() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("  "));
        assert!(is_placeholder("CHANGE_THIS_IN_PRODUCTION"));
        assert!(is_placeholder("your-vps-ip"));
        assert!(!is_placeholder("203.0.113.9"));
        assert!(!is_placeholder("root"));
    }

    #[test]
    fn test_defaults_cover_base_keys() {
        let defaults = service_defaults(true, Path::new("/root/.ssh/key"));
        for key in BASE_KEYS {
            assert!(defaults.iter().any(|(k, _)| k == key), "missing {}", key);
        }
        let env = defaults.iter().find(|(k, _)| k == ENVIRONMENT).unwrap();
        assert_eq!(env.1, "production");
        assert!(!defaults.iter().any(|(k, _)| k == VPS_ENABLED));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
