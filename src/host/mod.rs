//! Proxmox VE host adapter.
//!
//! [`PveHost`] exposes the subset of the `qm`, `pct`, `pvesh` and `pvesm`
//! command surface that provisioning consumes as typed methods. All commands
//! go through the shared [`CommandExecutor`], so tests can script host
//! behaviour and dry runs can log mutations instead of performing them.

pub mod storage;
pub mod vm_config;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::Deserialize;

use crate::args::CommandArgsBuilder;
use crate::config::HostConfig;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::interrupt::Interrupt;
use crate::privilege::PrivilegeMethod;

pub use storage::{StorageContent, StorageKind, StorageTarget};
pub use vm_config::VmConfig;

/// Smallest identifier Proxmox accepts for guests.
pub const MIN_VMID: u32 = 100;
/// Largest identifier Proxmox accepts for guests.
pub const MAX_VMID: u32 = 999_999_999;

/// A guest identifier (shared namespace for VMs and containers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(u32);

impl VmId {
    pub fn new(id: u32) -> Result<Self, ProvisionError> {
        if !(MIN_VMID..=MAX_VMID).contains(&id) {
            return Err(ProvisionError::Validation(format!(
                "identifier {} is out of range ({}..={})",
                id, MIN_VMID, MAX_VMID
            )));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for VmId {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"');
        let id = trimmed.parse::<u32>().map_err(|_| {
            ProvisionError::Validation(format!("identifier '{}' is not a positive integer", s.trim()))
        })?;
        Self::new(id)
    }
}

/// Read access to the guests that exist on the host.
pub trait HostInventory {
    /// Returns true if any VM or container already uses `id`.
    fn is_id_in_use(&self, id: VmId) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct ClusterResource {
    #[serde(default)]
    vmid: Option<u32>,
}

/// Typed access to the Proxmox VE command line tools.
pub struct PveHost {
    executor: Arc<dyn CommandExecutor>,
    privilege: Option<PrivilegeMethod>,
    command_timeout: Duration,
    import_timeout: Duration,
    interrupt: Interrupt,
}

impl PveHost {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &HostConfig) -> Self {
        Self {
            executor,
            privilege: config.privilege,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            import_timeout: Duration::from_secs(config.import_timeout_secs),
            interrupt: Interrupt::new(),
        }
    }

    /// Refuses to start further commands once `interrupt` is raised.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn prepare(&self, spec: CommandSpec) -> CommandSpec {
        spec.with_privilege(self.privilege)
            .with_timeout(self.command_timeout)
            .with_env("LC_ALL", "C")
    }

    /// Runs a spec and turns a non-zero exit into a typed `Execution` error.
    fn run(&self, spec: CommandSpec) -> Result<ExecutionResult> {
        self.interrupt
            .check(|| format!("not running {}", spec.display()))?;
        let result = self
            .executor
            .execute(&spec)
            .with_context(|| format!("failed to execute {}", spec.display()))?;
        if !result.success() {
            let code = result
                .code()
                .map(|c| format!("exit status {}", c))
                .unwrap_or_else(|| "terminated by signal".to_string());
            let status = match result.stderr_tail() {
                Some(tail) => format!("{}: {}", code, tail),
                None => code,
            };
            return Err(ProvisionError::Execution {
                command: spec.display(),
                status,
            }
            .into());
        }
        Ok(result)
    }

    fn query(&self, command: &str, args: &[&str]) -> Result<String> {
        let spec = CommandSpec::query(command, args.iter().map(|a| a.to_string()).collect());
        Ok(self.run(self.prepare(spec))?.stdout)
    }

    fn mutate(&self, command: &str, args: Vec<String>) -> Result<ExecutionResult> {
        self.run(self.prepare(CommandSpec::new(command, args)))
    }

    /// Asks the cluster allocator for the next free identifier.
    pub fn next_id(&self) -> Result<VmId> {
        let output = self.query("pvesh", &["get", "/cluster/nextid"])?;
        output
            .parse::<VmId>()
            .with_context(|| format!("unexpected allocator output: {:?}", output.trim()))
    }

    /// Lists active storage backends accepting `content`.
    pub fn list_storage(&self, content: StorageContent) -> Result<Vec<StorageTarget>> {
        let output = self.query("pvesm", &["status", "--content", &content.to_string()])?;
        Ok(storage::parse_pvesm_status(&output))
    }

    /// Creates a VM with the given `qm create` options.
    pub fn create_vm(&self, id: VmId, options: Vec<String>) -> Result<()> {
        let mut args = vec!["create".to_string(), id.to_string()];
        args.extend(options);
        self.mutate("qm", args).map(drop)
    }

    /// Applies `qm set` options to a VM.
    pub fn set_vm_options(&self, id: VmId, options: Vec<String>) -> Result<()> {
        let mut args = vec!["set".to_string(), id.to_string()];
        args.extend(options);
        self.mutate("qm", args).map(drop)
    }

    /// Imports a disk image into `storage` and returns the command output.
    pub fn import_disk(
        &self,
        id: VmId,
        image: &Utf8Path,
        storage: &StorageTarget,
    ) -> Result<ExecutionResult> {
        let mut args = CommandArgsBuilder::new();
        args.push_arg("importdisk")
            .push_arg(id.to_string())
            .push_arg(image.as_str())
            .push_arg(&storage.name)
            .push_opt("--format", storage.kind.import_format());
        let spec = self
            .prepare(CommandSpec::new("qm", args.into_args()))
            .with_timeout(self.import_timeout);
        self.run(spec)
    }

    /// Reads the current VM configuration.
    pub fn vm_config(&self, id: VmId) -> Result<VmConfig> {
        let output = self.query("qm", &["config", &id.to_string()])?;
        Ok(VmConfig::parse(&output))
    }

    /// Grows `disk` to `size_gib`.
    pub fn resize_disk(&self, id: VmId, disk: &str, size_gib: u32) -> Result<()> {
        let args = vec![
            "resize".to_string(),
            id.to_string(),
            disk.to_string(),
            format!("{}G", size_gib),
        ];
        self.mutate("qm", args).map(drop)
    }

    /// Removes an `unusedN` entry from the VM configuration.
    pub fn delete_unused(&self, id: VmId, slot: &str) -> Result<()> {
        self.set_vm_options(id, vec!["--delete".to_string(), slot.to_string()])
    }

    pub fn set_boot_order(&self, id: VmId, disk: &str) -> Result<()> {
        self.set_vm_options(id, vec!["--boot".to_string(), format!("order={}", disk)])
    }

    pub fn start_vm(&self, id: VmId) -> Result<()> {
        self.mutate("qm", vec!["start".to_string(), id.to_string()])
            .map(drop)
    }

    /// Creates a container from `template` with the given `pct create` options.
    pub fn create_container(&self, id: VmId, template: &str, options: Vec<String>) -> Result<()> {
        let mut args = vec!["create".to_string(), id.to_string(), template.to_string()];
        args.extend(options);
        self.mutate("pct", args).map(drop)
    }

    pub fn start_container(&self, id: VmId) -> Result<()> {
        self.mutate("pct", vec!["start".to_string(), id.to_string()])
            .map(drop)
    }

    /// Runs a shell command inside a running container.
    pub fn exec_in_container(&self, id: VmId, command: &str) -> Result<ExecutionResult> {
        let mut args = CommandArgsBuilder::new();
        args.push_arg("exec")
            .push_arg(id.to_string())
            .push_arg("--")
            .push_arg("sh")
            .push_arg("-c")
            .push_arg(command);
        self.mutate("pct", args.into_args())
    }
}

impl HostInventory for PveHost {
    fn is_id_in_use(&self, id: VmId) -> Result<bool> {
        let output = self.query(
            "pvesh",
            &["get", "/cluster/resources", "--type", "vm", "--output-format", "json"],
        )?;
        let resources: Vec<ClusterResource> = serde_json::from_str(output.trim())
            .context("failed to parse cluster resource list")?;
        Ok(resources.iter().any(|r| r.vmid == Some(id.get())))
    }
}
