//! Shared command argument builder utilities for host commands.
//!
//! Proxmox CLIs take `--option value` pairs where many values are
//! comma-separated property strings (`virtio,bridge=vmbr0,tag=20`).

use std::fmt::Display;

/// Builder for assembling command arguments consistently across host commands.
#[derive(Debug, Default)]
pub struct CommandArgsBuilder {
    args: Vec<String>,
}

impl CommandArgsBuilder {
    /// Create a new, empty builder.
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    /// Append a raw argument to the builder.
    pub fn push_arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Append a flag with value if the value is not empty.
    pub fn push_flag_value(&mut self, flag: &str, value: impl Display) -> &mut Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.args.push(flag.to_string());
            self.args.push(value);
        }
        self
    }

    /// Append a flag with value only when `value` is `Some`.
    pub fn push_opt<T: Display>(&mut self, flag: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.push_flag_value(flag, value);
        }
        self
    }

    /// Append a Proxmox boolean option (`1` / `0`).
    pub fn push_bool(&mut self, flag: &str, value: bool) -> &mut Self {
        self.push_flag_value(flag, if value { "1" } else { "0" })
    }

    /// Return the collected arguments.
    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// Builder for comma-separated Proxmox property strings.
///
/// The first element may be a bare value (`virtio`, `local-lvm:vm-101-disk-0`);
/// the remaining elements are `key=value` pairs.
#[derive(Debug, Default)]
pub struct PropertyString {
    parts: Vec<String>,
}

impl PropertyString {
    pub fn new(head: impl Into<String>) -> Self {
        Self {
            parts: vec![head.into()],
        }
    }

    /// Creates a property string with no bare head element.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Display) -> Self {
        self.parts.push(format!("{}={}", key, value));
        self
    }

    pub fn set_opt<T: Display>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self,
        }
    }
}

impl Display for PropertyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.parts.join(","))
    }
}
