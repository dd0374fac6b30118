//! Privilege escalation configuration.
//!
//! Proxmox host tooling (`qm`, `pct`, `pvesm`, `pvesh`) requires root. When
//! pvestrap is run from an unprivileged administrator account, every host
//! command can be wrapped with `sudo` or `doas`.

use serde::{Deserialize, Serialize};

/// Privilege escalation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMethod {
    /// Use `sudo` for privilege escalation.
    Sudo,
    /// Use `doas` for privilege escalation.
    Doas,
}

impl PrivilegeMethod {
    /// Returns the command name for this privilege method.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Sudo => "sudo",
            Self::Doas => "doas",
        }
    }

    /// Wraps `command` and `args` so that they run through this method.
    ///
    /// `sudo` receives `--` so that arguments starting with `-` are never
    /// interpreted as its own options.
    pub fn wrap(&self, command: &str, args: &[String]) -> (String, Vec<String>) {
        let mut wrapped = Vec::with_capacity(args.len() + 2);
        if matches!(self, Self::Sudo) {
            wrapped.push("--".to_string());
        }
        wrapped.push(command.to_string());
        wrapped.extend(args.iter().cloned());
        (self.command_name().to_string(), wrapped)
    }
}

impl std::fmt::Display for PrivilegeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command_name())
    }
}
