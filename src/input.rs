// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator inputs for one run
//!
//! Inputs come either from an attended terminal or from environment
//! variables. The source is picked once at startup by [`select_source`];
//! command-line flags override both.

use std::collections::HashMap;
use std::fmt;

use console::Term;
use tracing::debug;

use crate::error::{ProvisionError, Result};
use crate::store::schema::{self, DEFAULT_CAMERA_PASSWORD};
use crate::store::{is_placeholder, is_valid_address, ConfigDocument};

pub const ENV_DOMAIN: &str = "DOMAIN_NAME";
pub const ENV_EMAIL: &str = "SSL_EMAIL";
pub const ENV_VPS_IP: &str = "VPS_IP";
pub const ENV_VPS_USER: &str = "VPS_USER";
pub const ENV_VPS_PASSWORD: &str = "VPS_PASSWORD";
pub const ENV_CAMERA_IP: &str = "CAMERA_IP";
pub const ENV_CAMERA_USER: &str = "CAMERA_USER";
pub const ENV_CAMERA_PASS: &str = "CAMERA_PASS";

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub production: bool,
    pub camera_ip: Option<String>,
    pub camera_user: Option<String>,
    pub camera_pass: Option<String>,
}

/// Everything the operator supplied for this run. `None` means "keep what the
/// environment file already has".
#[derive(Clone, Default)]
pub struct ProvisionInputs {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub vps_ip: Option<String>,
    pub vps_user: Option<String>,
    pub vps_password: Option<String>,
    pub camera_ip: Option<String>,
    pub camera_user: Option<String>,
    pub camera_pass: Option<String>,
    pub production: bool,
}

impl fmt::Debug for ProvisionInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionInputs")
            .field("domain", &self.domain)
            .field("email", &self.email)
            .field("vps_ip", &self.vps_ip)
            .field("vps_user", &self.vps_user)
            .field("vps_password", &self.vps_password.as_ref().map(|_| "<redacted>"))
            .field("camera_ip", &self.camera_ip)
            .field("camera_user", &self.camera_user)
            .field("camera_pass", &self.camera_pass.as_ref().map(|_| "<redacted>"))
            .field("production", &self.production)
            .finish()
    }
}

impl ProvisionInputs {
    /// Reject malformed input before anything is mutated
    pub fn validate(&self) -> Result<()> {
        if let Some(ip) = &self.vps_ip {
            if !is_valid_address(ip) {
                return Err(ProvisionError::validation(format!(
                    "VPS_IP '{}' is not an IP address or hostname",
                    ip
                )));
            }
        }
        if let Some(user) = &self.vps_user {
            if user.contains(char::is_whitespace) || user.contains('@') {
                return Err(ProvisionError::validation(format!(
                    "VPS_USER '{}' is not a valid user name",
                    user
                )));
            }
        }
        if let Some(ip) = &self.camera_ip {
            if !is_valid_address(ip) {
                return Err(ProvisionError::validation(format!(
                    "camera address '{}' is not an IP address or hostname",
                    ip
                )));
            }
        }
        if let Some(domain) = &self.domain {
            if !is_valid_address(domain) || domain.parse::<std::net::IpAddr>().is_ok() {
                return Err(ProvisionError::validation(format!(
                    "DOMAIN_NAME '{}' is not a domain name",
                    domain
                )));
            }
            match &self.email {
                Some(email) if is_plausible_email(email) => {}
                Some(email) => {
                    return Err(ProvisionError::validation(format!(
                        "SSL_EMAIL '{}' is not an email address",
                        email
                    )))
                }
                None => {
                    return Err(ProvisionError::validation(
                        "SSL_EMAIL is required when DOMAIN_NAME is set",
                    ))
                }
            }
        }
        if self.production && self.camera_pass.as_deref() == Some(DEFAULT_CAMERA_PASSWORD) {
            return Err(ProvisionError::validation(
                "the factory camera password cannot be used in production",
            ));
        }
        Ok(())
    }

    pub fn password_supplied(&self) -> bool {
        self.vps_password.is_some()
    }

    fn apply_overrides(mut self, overrides: &CliOverrides) -> Self {
        self.production = overrides.production;
        if overrides.camera_ip.is_some() {
            self.camera_ip = overrides.camera_ip.clone();
        }
        if overrides.camera_user.is_some() {
            self.camera_user = overrides.camera_user.clone();
        }
        if overrides.camera_pass.is_some() {
            self.camera_pass = overrides.camera_pass.clone();
        }
        self
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, host)) => {
            !local.is_empty() && host.contains('.') && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Where operator inputs come from
pub trait InputSource {
    fn name(&self) -> &'static str;

    /// Collect inputs, using `existing` for defaults where the source asks
    fn gather(&self, existing: &ConfigDocument, overrides: &CliOverrides) -> Result<ProvisionInputs>;
}

/// Inputs from environment variables
#[derive(Clone, Default)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    /// Snapshot the process environment
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        non_empty(self.vars.get(name).cloned())
    }
}

impl InputSource for EnvSource {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn gather(&self, _existing: &ConfigDocument, overrides: &CliOverrides) -> Result<ProvisionInputs> {
        let inputs = ProvisionInputs {
            domain: self.var(ENV_DOMAIN),
            email: self.var(ENV_EMAIL),
            vps_ip: self.var(ENV_VPS_IP),
            vps_user: self.var(ENV_VPS_USER),
            vps_password: self.var(ENV_VPS_PASSWORD),
            camera_ip: self.var(ENV_CAMERA_IP),
            camera_user: self.var(ENV_CAMERA_USER),
            camera_pass: self.var(ENV_CAMERA_PASS),
            production: false,
        };
        Ok(inputs.apply_overrides(overrides))
    }
}

/// Inputs prompted on the terminal
pub struct InteractiveSource {
    term: Term,
}

impl Default for InteractiveSource {
    fn default() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl InteractiveSource {
    fn prompt(&self, label: &str, default: Option<&str>) -> Result<Option<String>> {
        match default {
            Some(d) => self.term.write_str(&format!("{} [{}]: ", label, d))?,
            None => self.term.write_str(&format!("{} (leave empty to skip): ", label))?,
        }
        let answer = non_empty(Some(self.term.read_line()?));
        Ok(answer.or_else(|| default.map(str::to_string)))
    }

    fn prompt_secret(&self, label: &str) -> Result<Option<String>> {
        self.term
            .write_str(&format!("{} (leave empty to skip): ", label))?;
        Ok(non_empty(Some(self.term.read_secure_line()?)))
    }
}

fn existing_value(doc: &ConfigDocument, key: &str) -> Option<String> {
    doc.get(key)
        .filter(|v| !is_placeholder(v))
        .map(str::to_string)
}

impl InputSource for InteractiveSource {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn gather(&self, existing: &ConfigDocument, overrides: &CliOverrides) -> Result<ProvisionInputs> {
        self.term
            .write_line("imgserv provisioning. Press Enter to keep the value in brackets.")?;

        let domain = self.prompt(
            "Public domain name",
            existing_value(existing, schema::DOMAIN_NAME).as_deref(),
        )?;
        let email = match &domain {
            Some(_) => self.prompt(
                "Contact email for certificates",
                existing_value(existing, schema::SSL_EMAIL).as_deref(),
            )?,
            None => None,
        };

        let vps_ip = self.prompt(
            "Edge host address",
            existing_value(existing, schema::VPS_HOST).as_deref(),
        )?;
        let (vps_user, vps_password) = match &vps_ip {
            Some(_) => {
                let default_user =
                    existing_value(existing, schema::VPS_USER).unwrap_or_else(|| "root".to_string());
                let user = self.prompt("Edge host SSH user", Some(&default_user))?;
                let password = self.prompt_secret("Edge host password for first-time key setup")?;
                (user, password)
            }
            None => (None, None),
        };

        debug!(domain = ?domain, vps_ip = ?vps_ip, "Collected terminal inputs");
        let inputs = ProvisionInputs {
            domain,
            email,
            vps_ip,
            vps_user,
            vps_password,
            ..ProvisionInputs::default()
        };
        Ok(inputs.apply_overrides(overrides))
    }
}

/// Terminal prompts when a person is attached and allowed, environment
/// variables otherwise
pub fn select_source(non_interactive: bool) -> Box<dyn InputSource> {
    if !non_interactive && console::user_attended() {
        Box::new(InteractiveSource::default())
    } else {
        Box::new(EnvSource::from_env())
    }
}
