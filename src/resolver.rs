//! Parameter resolution.
//!
//! The resolver merges the profile defaults, the command line / environment
//! overrides and interactively collected answers into one immutable
//! [`ProvisionRequest`]. Every field is validated on the way in; in
//! interactive mode a rejected answer is asked again, otherwise the first
//! [`ProvisionError::Validation`] is returned.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{Firmware, LATEST_VERSION, Profile, WorkloadKind};
use crate::error::ProvisionError;
use crate::factory::{ReleaseSource, SchematicId};
use crate::host::{HostInventory, VmId};
use crate::prompt::{Choice, PromptOutcome, Prompter};

/// Release used when the latest-version lookup fails.
pub const FALLBACK_TALOS_VERSION: &str = "v1.9.5";

/// Answers rejected in a row before the resolver gives up on a field.
const MAX_PROMPT_ATTEMPTS: usize = 5;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]{0,61}[A-Za-z0-9])?$").expect("name regex is valid")
});
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").expect("token regex is valid"));

/// CPU, memory and disk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceShape {
    pub cores: u32,
    pub memory_mib: u32,
    pub disk_gib: u32,
}

/// Network interface settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub bridge: String,
    pub vlan: Option<u16>,
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Bake the guest agent into the image and enable it on the VM
    pub guest_agent: bool,
}

/// Talos VM specific settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalosRequest {
    /// Concrete release tag, never `latest`
    pub version: String,
    pub firmware: Firmware,
    /// Known schematic; skips submission when set
    pub schematic: Option<SchematicId>,
    pub extensions: Vec<String>,
    pub kernel_args: Vec<String>,
}

/// Container specific settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub template: String,
    pub unprivileged: bool,
    pub nesting: bool,
    pub onboot: bool,
    pub setup: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    Talos(TalosRequest),
    Container(ContainerRequest),
}

/// Fully resolved, validated provisioning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// `None` asks the host allocator for the next free identifier
    pub vmid: Option<VmId>,
    pub name: String,
    pub shape: ResourceShape,
    pub network: NetworkAttachment,
    /// `None` lets the locator pick a storage backend
    pub storage: Option<String>,
    pub features: FeatureFlags,
    pub start: bool,
    pub workload: Workload,
}

impl ProvisionRequest {
    pub fn kind(&self) -> WorkloadKind {
        match self.workload {
            Workload::Talos(_) => WorkloadKind::Talos,
            Workload::Container(_) => WorkloadKind::Container,
        }
    }
}

/// Values injected from the command line or the environment.
///
/// Overridden fields are never prompted for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub vmid: Option<u32>,
    pub name: Option<String>,
    pub cores: Option<u32>,
    pub memory: Option<u32>,
    pub disk: Option<u32>,
    pub bridge: Option<String>,
    pub vlan: Option<u16>,
    pub mtu: Option<u16>,
    pub storage: Option<String>,
    pub version: Option<String>,
    pub schematic: Option<String>,
    pub firmware: Option<Firmware>,
    pub guest_agent: Option<bool>,
    pub start: Option<bool>,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Request(ProvisionRequest),
    /// The operator cancelled a prompt
    Cancelled,
}

/// Where a resolved release tag came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrigin {
    Explicit,
    Latest,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub tag: String,
    pub origin: VersionOrigin,
}

/// Turns a requested version into a concrete release tag.
///
/// `latest` is looked up through `source`; a failed or unavailable lookup
/// falls back to [`FALLBACK_TALOS_VERSION`] with a warning.
pub fn resolve_version(source: Option<&dyn ReleaseSource>, requested: &str) -> ResolvedVersion {
    if !requested.eq_ignore_ascii_case(LATEST_VERSION) {
        return ResolvedVersion {
            tag: requested.to_string(),
            origin: VersionOrigin::Explicit,
        };
    }
    let lookup = match source {
        Some(source) => source.latest_version().and_then(|tag| parse_version(&tag)),
        None => Err(ProvisionError::Config("no release source configured".to_string())),
    };
    match lookup {
        Ok(tag) => {
            info!("latest release is {}", tag);
            ResolvedVersion {
                tag,
                origin: VersionOrigin::Latest,
            }
        }
        Err(e) => {
            warn!(
                "latest version lookup failed ({}), falling back to {}",
                e, FALLBACK_TALOS_VERSION
            );
            ResolvedVersion {
                tag: FALLBACK_TALOS_VERSION.to_string(),
                origin: VersionOrigin::Fallback,
            }
        }
    }
}

fn invalid(message: String) -> ProvisionError {
    ProvisionError::Validation(message)
}

/// Parses an identifier; blank or `auto` means "allocate".
pub fn parse_vmid(value: &str) -> Result<Option<VmId>, ProvisionError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    value.parse::<VmId>().map(Some)
}

pub fn parse_name(value: &str) -> Result<String, ProvisionError> {
    let value = value.trim();
    if !NAME_RE.is_match(value) {
        return Err(invalid(format!(
            "name '{}' must be 1-63 letters, digits, '-' or '.', starting and ending alphanumeric",
            value
        )));
    }
    Ok(value.to_string())
}

/// Parses a strictly positive integer.
pub fn parse_positive(label: &str, value: &str) -> Result<u32, ProvisionError> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(format!("{} must be a positive integer, got '{}'", label, value.trim()))),
    }
}

/// Parses an optional numeric setting where blank or 0 means unset.
fn parse_optional(
    label: &str,
    value: &str,
    range: std::ops::RangeInclusive<u16>,
) -> Result<Option<u16>, ProvisionError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<u16>() {
        Ok(0) => Ok(None),
        Ok(n) if range.contains(&n) => Ok(Some(n)),
        _ => Err(invalid(format!(
            "{} must be blank, 0 or within {}..={}, got '{}'",
            label,
            range.start(),
            range.end(),
            value
        ))),
    }
}

pub fn parse_vlan(value: &str) -> Result<Option<u16>, ProvisionError> {
    parse_optional("vlan", value, 1..=4094)
}

pub fn parse_mtu(value: &str) -> Result<Option<u16>, ProvisionError> {
    parse_optional("mtu", value, 576..=65520)
}

fn parse_token(label: &str, value: &str) -> Result<String, ProvisionError> {
    let value = value.trim();
    if !TOKEN_RE.is_match(value) {
        return Err(invalid(format!("{} '{}' is empty or contains invalid characters", label, value)));
    }
    Ok(value.to_string())
}

/// Parses a release tag or the `latest` sentinel; must be non-empty.
pub fn parse_version(value: &str) -> Result<String, ProvisionError> {
    parse_token("version", value)
}

fn parse_storage(value: &str) -> Result<Option<String>, ProvisionError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    parse_token("storage", value).map(Some)
}

fn parse_firmware(value: &str) -> Result<Firmware, ProvisionError> {
    value
        .trim()
        .parse::<Firmware>()
        .map_err(|_| invalid(format!("firmware must be 'ovmf' or 'seabios', got '{}'", value.trim())))
}

/// Converts a prompter failure into the typed error space.
fn prompt_failure(err: anyhow::Error) -> ProvisionError {
    match err.downcast::<ProvisionError>() {
        Ok(typed) => typed,
        Err(other) => ProvisionError::Execution {
            command: "prompt".to_string(),
            status: format!("{:#}", other),
        },
    }
}

/// A promptable field.
struct Field {
    title: &'static str,
    prompt: &'static str,
}

/// Merges defaults, overrides and prompted answers into a request.
pub struct Resolver<'a> {
    profile: &'a Profile,
    overrides: &'a Overrides,
    prompter: &'a dyn Prompter,
    inventory: Option<&'a dyn HostInventory>,
    releases: Option<&'a dyn ReleaseSource>,
}

impl<'a> Resolver<'a> {
    pub fn new(profile: &'a Profile, overrides: &'a Overrides, prompter: &'a dyn Prompter) -> Self {
        Self {
            profile,
            overrides,
            prompter,
            inventory: None,
            releases: None,
        }
    }

    /// Checks prompted identifiers against the host so the operator can pick another.
    #[must_use]
    pub fn with_inventory(mut self, inventory: &'a dyn HostInventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    #[must_use]
    pub fn with_releases(mut self, releases: &'a dyn ReleaseSource) -> Self {
        self.releases = Some(releases);
        self
    }

    /// Resolves one field from its override, its default or the prompter.
    ///
    /// Returns `Ok(None)` when the operator cancels.
    fn text<T>(
        &self,
        advanced: bool,
        field: Field,
        overridden: Option<String>,
        default: String,
        parse: impl Fn(&str) -> Result<T, ProvisionError>,
    ) -> Result<Option<T>, ProvisionError> {
        if let Some(value) = overridden {
            return parse(&value).map(Some);
        }
        if !advanced {
            return parse(&default).map(Some);
        }
        let mut current = default;
        let mut attempts = 0;
        loop {
            let answer = match self
                .prompter
                .input(field.title, field.prompt, &current)
                .map_err(prompt_failure)?
            {
                PromptOutcome::Answered(answer) => answer,
                PromptOutcome::Cancelled => return Ok(None),
            };
            match parse(&answer) {
                Ok(value) => return Ok(Some(value)),
                Err(ProvisionError::Validation(message)) if attempts + 1 < MAX_PROMPT_ATTEMPTS => {
                    warn!("{}", message);
                    attempts += 1;
                    current = answer;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flag(
        &self,
        advanced: bool,
        field: Field,
        overridden: Option<bool>,
        default: bool,
    ) -> Result<Option<bool>, ProvisionError> {
        if let Some(value) = overridden {
            return Ok(Some(value));
        }
        if !advanced {
            return Ok(Some(default));
        }
        match self
            .prompter
            .confirm(field.title, field.prompt, default)
            .map_err(prompt_failure)?
        {
            PromptOutcome::Answered(value) => Ok(Some(value)),
            PromptOutcome::Cancelled => Ok(None),
        }
    }

    fn firmware(&self, advanced: bool, default: Firmware) -> Result<Option<Firmware>, ProvisionError> {
        if let Some(firmware) = self.overrides.firmware {
            return Ok(Some(firmware));
        }
        if !advanced {
            return Ok(Some(default));
        }
        let choices = [
            Choice::new(Firmware::Ovmf.to_string(), "UEFI (OVMF)"),
            Choice::new(Firmware::Seabios.to_string(), "Legacy BIOS (SeaBIOS)"),
        ];
        match self
            .prompter
            .select("Firmware", "Select the VM firmware", &choices, &default.to_string())
            .map_err(prompt_failure)?
        {
            PromptOutcome::Answered(tag) => parse_firmware(&tag).map(Some),
            PromptOutcome::Cancelled => Ok(None),
        }
    }

    /// Rejects prompted identifiers that already exist on the host.
    fn ensure_free(&self, id: Option<VmId>) -> Result<Option<VmId>, ProvisionError> {
        if let (Some(id), Some(inventory)) = (id, self.inventory) {
            let in_use = inventory.is_id_in_use(id).map_err(prompt_failure)?;
            if in_use {
                return Err(invalid(format!("identifier {} is already in use", id)));
            }
        }
        Ok(id)
    }

    /// Produces the immutable request, or `Cancelled` if the operator backed out.
    pub fn resolve(&self) -> Result<Resolved, ProvisionError> {
        let profile = self.profile;
        let overrides = self.overrides;
        let defaults = &profile.defaults;

        let advanced = if self.prompter.is_interactive() {
            match self
                .prompter
                .confirm(
                    "Settings",
                    "Use default settings?\n\nChoose 'No' to review every field.",
                    true,
                )
                .map_err(prompt_failure)?
            {
                PromptOutcome::Answered(use_defaults) => !use_defaults,
                PromptOutcome::Cancelled => return Ok(Resolved::Cancelled),
            }
        } else {
            false
        };
        debug!("resolving {} request (advanced: {})", profile.kind, advanced);

        macro_rules! answered {
            ($value:expr) => {
                match $value? {
                    Some(value) => value,
                    None => return Ok(Resolved::Cancelled),
                }
            };
        }

        let check_in_use = advanced && overrides.vmid.is_none();
        let vmid = answered!(self.text(
            advanced,
            Field {
                title: "Identifier",
                prompt: "VM/container ID (blank for the next free one)",
            },
            overrides.vmid.map(|v| v.to_string()),
            defaults.vmid.map(|v| v.to_string()).unwrap_or_default(),
            |s| {
                let id = parse_vmid(s)?;
                if check_in_use { self.ensure_free(id) } else { Ok(id) }
            },
        ));
        let name = answered!(self.text(
            advanced,
            Field {
                title: "Name",
                prompt: "Hostname",
            },
            overrides.name.clone(),
            defaults.name.clone().unwrap_or_else(|| profile.kind.to_string()),
            parse_name,
        ));
        let cores = answered!(self.text(
            advanced,
            Field {
                title: "CPU",
                prompt: "Number of CPU cores",
            },
            overrides.cores.map(|v| v.to_string()),
            defaults.cores.to_string(),
            |s| parse_positive("cores", s),
        ));
        let memory_mib = answered!(self.text(
            advanced,
            Field {
                title: "Memory",
                prompt: "Memory in MiB",
            },
            overrides.memory.map(|v| v.to_string()),
            defaults.memory.to_string(),
            |s| parse_positive("memory", s),
        ));
        let disk_gib = answered!(self.text(
            advanced,
            Field {
                title: "Disk",
                prompt: "Disk size in GiB",
            },
            overrides.disk.map(|v| v.to_string()),
            defaults.disk.to_string(),
            |s| parse_positive("disk", s),
        ));
        let bridge = answered!(self.text(
            advanced,
            Field {
                title: "Bridge",
                prompt: "Network bridge",
            },
            overrides.bridge.clone(),
            defaults.bridge.clone(),
            |s| parse_token("bridge", s),
        ));
        let vlan = answered!(self.text(
            advanced,
            Field {
                title: "VLAN",
                prompt: "VLAN tag (blank for none)",
            },
            overrides.vlan.map(|v| v.to_string()),
            defaults.vlan.map(|v| v.to_string()).unwrap_or_default(),
            parse_vlan,
        ));
        let mtu = answered!(self.text(
            advanced,
            Field {
                title: "MTU",
                prompt: "Interface MTU (blank for the bridge default)",
            },
            overrides.mtu.map(|v| v.to_string()),
            defaults.mtu.map(|v| v.to_string()).unwrap_or_default(),
            parse_mtu,
        ));
        let storage = answered!(self.text(
            advanced,
            Field {
                title: "Storage",
                prompt: "Storage for the disk (blank to pick automatically)",
            },
            overrides.storage.clone(),
            defaults.storage.clone().unwrap_or_default(),
            parse_storage,
        ));

        let (workload, guest_agent) = match profile.kind {
            WorkloadKind::Talos => {
                let talos = &profile.talos;
                let requested = answered!(self.text(
                    advanced,
                    Field {
                        title: "Talos version",
                        prompt: "Release tag, or 'latest'",
                    },
                    overrides.version.clone(),
                    talos.version.clone(),
                    parse_version,
                ));
                let firmware = answered!(self.firmware(advanced, talos.firmware));
                let guest_agent = answered!(self.flag(
                    advanced,
                    Field {
                        title: "Guest agent",
                        prompt: "Include the QEMU guest agent?",
                    },
                    overrides.guest_agent,
                    talos.guest_agent,
                ));
                let schematic = overrides
                    .schematic
                    .clone()
                    .or_else(|| talos.schematic.clone())
                    .map(|id| SchematicId::new(id.trim()))
                    .transpose()?;
                let version = resolve_version(self.releases, &requested);
                debug!("talos version {} ({:?})", version.tag, version.origin);
                (
                    Workload::Talos(TalosRequest {
                        version: version.tag,
                        firmware,
                        schematic,
                        extensions: talos.extensions.clone(),
                        kernel_args: talos.kernel_args.clone(),
                    }),
                    guest_agent,
                )
            }
            WorkloadKind::Container => {
                let container = profile.container.as_ref().ok_or_else(|| {
                    ProvisionError::Config("kind 'container' requires a 'container' section".to_string())
                })?;
                (
                    Workload::Container(ContainerRequest {
                        template: container.template.clone(),
                        unprivileged: container.unprivileged,
                        nesting: container.nesting,
                        onboot: container.onboot,
                        setup: container.setup.clone(),
                    }),
                    false,
                )
            }
        };

        let start = answered!(self.flag(
            advanced,
            Field {
                title: "Start",
                prompt: "Start the resource when provisioning completes?",
            },
            overrides.start,
            defaults.start,
        ));
        if let Workload::Container(container) = &workload
            && !container.setup.is_empty()
            && !start
        {
            return Err(invalid("container setup commands require start".to_string()));
        }

        Ok(Resolved::Request(ProvisionRequest {
            vmid,
            name,
            shape: ResourceShape {
                cores,
                memory_mib,
                disk_gib,
            },
            network: NetworkAttachment { bridge, vlan, mtu },
            storage,
            features: FeatureFlags { guest_agent },
            start,
            workload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Releases(Result<&'static str, &'static str>);

    impl ReleaseSource for Releases {
        fn latest_version(&self) -> Result<String, ProvisionError> {
            self.0
                .map(str::to_string)
                .map_err(|e| ProvisionError::fetch(e.to_string()))
        }
    }

    #[test]
    fn vmid_blank_or_auto_means_allocate() {
        assert_eq!(parse_vmid("").unwrap(), None);
        assert_eq!(parse_vmid(" auto ").unwrap(), None);
        assert_eq!(parse_vmid("120").unwrap().map(VmId::get), Some(120));
        assert!(matches!(parse_vmid("0"), Err(ProvisionError::Validation(_))));
        assert!(parse_vmid("x1").is_err());
    }

    #[test]
    fn positive_integers() {
        assert_eq!(parse_positive("cores", "4").unwrap(), 4);
        assert!(parse_positive("cores", "0").is_err());
        assert!(parse_positive("cores", "-1").is_err());
        assert!(parse_positive("memory", "").is_err());
    }

    #[test]
    fn vlan_and_mtu_zero_or_blank_are_unset() {
        assert_eq!(parse_vlan("").unwrap(), None);
        assert_eq!(parse_vlan("0").unwrap(), None);
        assert_eq!(parse_vlan("42").unwrap(), Some(42));
        assert!(parse_vlan("4095").is_err());
        assert_eq!(parse_mtu(" ").unwrap(), None);
        assert_eq!(parse_mtu("0").unwrap(), None);
        assert_eq!(parse_mtu("1450").unwrap(), Some(1450));
        assert!(parse_mtu("100").is_err());
    }

    #[test]
    fn names_are_hostnames() {
        assert_eq!(parse_name(" talos-cp-1 ").unwrap(), "talos-cp-1");
        assert!(parse_name("").is_err());
        assert!(parse_name("-bad").is_err());
        assert!(parse_name("has space").is_err());
    }

    #[test]
    fn version_must_be_non_empty() {
        assert_eq!(parse_version("v1.9.0").unwrap(), "v1.9.0");
        assert!(parse_version("").is_err());
        assert!(parse_version("v1/../x").is_err());
    }

    #[test]
    fn explicit_version_skips_lookup() {
        let source = Releases(Err("must not be called"));
        let v = resolve_version(Some(&source), "v1.8.0");
        assert_eq!(v.tag, "v1.8.0");
        assert_eq!(v.origin, VersionOrigin::Explicit);
    }

    #[test]
    fn latest_version_is_looked_up() {
        let source = Releases(Ok("v1.10.2"));
        let v = resolve_version(Some(&source), "latest");
        assert_eq!(v.tag, "v1.10.2");
        assert_eq!(v.origin, VersionOrigin::Latest);
    }

    #[test]
    fn failed_lookup_falls_back() {
        let source = Releases(Err("HTTP 503"));
        let v = resolve_version(Some(&source), "LATEST");
        assert_eq!(v.tag, FALLBACK_TALOS_VERSION);
        assert_eq!(v.origin, VersionOrigin::Fallback);
        assert_eq!(resolve_version(None, "latest").origin, VersionOrigin::Fallback);
    }

    #[test]
    fn malformed_latest_tag_falls_back() {
        let source = Releases(Ok(""));
        assert_eq!(resolve_version(Some(&source), "latest").origin, VersionOrigin::Fallback);
    }
}
