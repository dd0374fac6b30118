//! Profile configuration.
//!
//! A profile is a YAML document describing what to provision and how to reach
//! the external services involved. Every section is optional; omitted fields
//! fall back to the built-in defaults defined here.
//!
//! ```yaml
//! kind: talos
//! defaults:
//!   name: talos-cp-1
//!   cores: 4
//!   memory: 8192
//!   disk: 32
//! talos:
//!   version: latest
//!   guest_agent: true
//! ```

use std::fs::File;
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::error::ProvisionError;
use crate::privilege::PrivilegeMethod;

/// Version sentinel asking the resolver to look up the latest release.
pub const LATEST_VERSION: &str = "latest";

/// What kind of resource the profile provisions.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkloadKind {
    /// Talos Linux virtual machine booted from an image-factory disk image
    #[default]
    Talos,
    /// LXC container created from a host template
    Container,
}

/// VM firmware.
#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Firmware {
    /// Legacy BIOS
    Seabios,
    /// UEFI; requires an EFI vars disk
    #[default]
    Ovmf,
}

/// Default values for the provisioning request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestDefaults {
    /// Explicit identifier; absent means "allocate the next free one"
    pub vmid: Option<u32>,
    /// Resource name; defaults to the workload kind
    pub name: Option<String>,
    pub cores: u32,
    /// Memory in MiB
    pub memory: u32,
    /// Disk size in GiB
    pub disk: u32,
    pub bridge: String,
    /// VLAN tag; 0 means untagged
    pub vlan: Option<u16>,
    /// Interface MTU; 0 means the bridge default
    pub mtu: Option<u16>,
    /// Storage backend; absent means "pick one"
    pub storage: Option<String>,
    /// Start the resource once provisioned
    pub start: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            vmid: None,
            name: None,
            cores: 2,
            memory: 2048,
            disk: 10,
            bridge: "vmbr0".to_string(),
            vlan: None,
            mtu: None,
            storage: None,
            start: true,
        }
    }
}

/// Talos image settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TalosConfig {
    /// Release tag (e.g. `v1.9.0`) or `latest`
    pub version: String,
    pub firmware: Firmware,
    /// Bake the QEMU guest agent extension and enable the agent on the VM
    pub guest_agent: bool,
    /// Known schematic id; skips schematic submission when set
    pub schematic: Option<String>,
    /// Additional official system extensions (e.g. `siderolabs/iscsi-tools`)
    pub extensions: Vec<String>,
    /// Extra kernel arguments baked into the image
    pub kernel_args: Vec<String>,
}

impl Default for TalosConfig {
    fn default() -> Self {
        Self {
            version: LATEST_VERSION.to_string(),
            firmware: Firmware::default(),
            guest_agent: true,
            schematic: None,
            extensions: Vec::new(),
            kernel_args: Vec::new(),
        }
    }
}

/// Image factory and release service endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FactoryConfig {
    pub url: String,
    /// Endpoint answering with the latest release as JSON (`tag_name`)
    pub releases_url: String,
    pub arch: String,
    /// Image platform (e.g. `nocloud`, `metal`)
    pub platform: String,
    /// Image file extension (e.g. `qcow2`)
    pub format: String,
    /// Timeout for API calls
    pub timeout_secs: u64,
    /// Timeout for the whole image download
    pub download_timeout_secs: u64,
    /// Attempts for transient network failures (1 disables retry)
    pub retries: u32,
    /// Initial backoff delay, doubled after every failed attempt
    pub retry_delay_ms: u64,
    /// Parent directory for the scoped download directory
    pub scratch_dir: Option<Utf8PathBuf>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            url: "https://factory.talos.dev".to_string(),
            releases_url: "https://api.github.com/repos/siderolabs/talos/releases/latest"
                .to_string(),
            arch: "amd64".to_string(),
            platform: "nocloud".to_string(),
            format: "qcow2".to_string(),
            timeout_secs: 60,
            download_timeout_secs: 3600,
            retries: 3,
            retry_delay_ms: 1000,
            scratch_dir: None,
        }
    }
}

impl FactoryConfig {
    /// Returns the scratch parent directory, defaulting to the system temp dir.
    pub fn scratch_root(&self) -> Result<Utf8PathBuf, ProvisionError> {
        match &self.scratch_dir {
            Some(dir) => Ok(dir.clone()),
            None => Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|p| {
                ProvisionError::Config(format!("temp dir is not valid UTF-8: {}", p.display()))
            }),
        }
    }
}

/// Host command settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Storage preferred when the request does not name one
    pub default_storage: String,
    pub privilege: Option<PrivilegeMethod>,
    pub command_timeout_secs: u64,
    /// Timeout for disk imports, which copy the whole image
    pub import_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            default_storage: "local-lvm".to_string(),
            privilege: None,
            command_timeout_secs: 300,
            import_timeout_secs: 3600,
        }
    }
}

/// Container workload settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    /// Template volume (e.g. `local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst`)
    pub template: String,
    #[serde(default = "default_true")]
    pub unprivileged: bool,
    #[serde(default = "default_true")]
    pub nesting: bool,
    /// Start the container when the host boots
    #[serde(default)]
    pub onboot: bool,
    /// Shell commands run inside the started container, in order
    #[serde(default)]
    pub setup: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// A complete provisioning profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub kind: WorkloadKind,
    #[serde(default)]
    pub defaults: RequestDefaults,
    #[serde(default)]
    pub talos: TalosConfig,
    #[serde(default)]
    pub factory: FactoryConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub container: Option<ContainerConfig>,
}

impl Profile {
    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        match self.kind {
            WorkloadKind::Talos => {
                for (label, value) in [
                    ("factory.url", &self.factory.url),
                    ("factory.releases_url", &self.factory.releases_url),
                ] {
                    Url::parse(value).map_err(|e| {
                        ProvisionError::Config(format!("{} '{}' is not a valid URL: {}", label, value, e))
                    })?;
                }
                for (label, value) in [
                    ("factory.arch", &self.factory.arch),
                    ("factory.platform", &self.factory.platform),
                    ("factory.format", &self.factory.format),
                ] {
                    if value.trim().is_empty() {
                        return Err(ProvisionError::Config(format!("{} must not be empty", label)));
                    }
                }
                if self.factory.retries == 0 {
                    return Err(ProvisionError::Config(
                        "factory.retries must be at least 1".to_string(),
                    ));
                }
                if self.container.is_some() {
                    tracing::warn!("'container' section is ignored for kind 'talos'");
                }
            }
            WorkloadKind::Container => {
                let Some(container) = &self.container else {
                    return Err(ProvisionError::Config(
                        "kind 'container' requires a 'container' section".to_string(),
                    ));
                };
                if container.template.trim().is_empty() {
                    return Err(ProvisionError::Config(
                        "container.template must not be empty".to_string(),
                    ));
                }
                if !container.setup.is_empty() && !self.defaults.start {
                    return Err(ProvisionError::Config(
                        "container.setup requires defaults.start to be true".to_string(),
                    ));
                }
            }
        }
        if self.host.command_timeout_secs == 0 || self.host.import_timeout_secs == 0 {
            return Err(ProvisionError::Config("host timeouts must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parses a profile from YAML text.
pub fn parse_profile(yaml: &str) -> Result<Profile, ProvisionError> {
    serde_yaml::from_str(yaml).map_err(|e| ProvisionError::Config(format!("YAML parse error: {}", e)))
}

/// Loads a profile from a YAML file.
pub fn load_profile(path: &Utf8Path) -> Result<Profile, ProvisionError> {
    let file = File::open(path).map_err(|e| ProvisionError::io(path.as_str(), e))?;
    let reader = BufReader::new(file);
    serde_yaml::from_reader(reader)
        .map_err(|e| ProvisionError::Config(format!("failed to parse {}: {}", path, e)))
}
