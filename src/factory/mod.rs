//! Talos image factory integration.
//!
//! The image factory builds boot images from a declarative customization
//! document (a *schematic*). Submitting a schematic returns its content
//! address, which together with a release version and architecture yields a
//! deterministic download URL:
//!
//! ```text
//! {base}/image/{schematic}/{version}/{platform}-{arch}.{format}
//! ```

mod client;
mod fetcher;

use std::fmt;
use std::io::Read;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::error::ProvisionError;

pub use client::FactoryClient;
pub use fetcher::{ArtifactFetcher, FetchStage, FetchState, LocalArtifact, RetryPolicy, with_retry};

/// Official extension providing the QEMU guest agent.
pub const GUEST_AGENT_EXTENSION: &str = "siderolabs/qemu-guest-agent";

static SCHEMATIC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{16,128}$").expect("schematic id regex is valid"));

/// Content address of a schematic, as returned by the factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchematicId(String);

impl SchematicId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProvisionError> {
        let id = id.into();
        if !SCHEMATIC_ID_RE.is_match(&id) {
            return Err(ProvisionError::Validation(format!(
                "schematic id '{}' is not a lowercase hex digest",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchematicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemExtensions {
    official_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Customization {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_kernel_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_extensions: Option<SystemExtensions>,
}

/// Image customization document submitted to the factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schematic {
    customization: Customization,
}

impl Schematic {
    /// Builds the document from the requested features.
    ///
    /// The guest agent extension comes first when enabled; duplicates are
    /// dropped so that equal inputs always produce the same document.
    pub fn new(guest_agent: bool, extensions: &[String], kernel_args: &[String]) -> Self {
        let mut official = Vec::new();
        let requested = guest_agent
            .then_some(GUEST_AGENT_EXTENSION)
            .into_iter()
            .chain(extensions.iter().map(String::as_str));
        for ext in requested {
            let ext = ext.trim();
            if !ext.is_empty() && !official.iter().any(|e| e == ext) {
                official.push(ext.to_string());
            }
        }
        Self {
            customization: Customization {
                extra_kernel_args: kernel_args.to_vec(),
                system_extensions: (!official.is_empty()).then_some(SystemExtensions {
                    official_extensions: official,
                }),
            },
        }
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.customization
            .system_extensions
            .as_ref()
            .is_some_and(|s| s.official_extensions.iter().any(|e| e == name))
    }

    /// Renders the YAML body accepted by `POST /schematics`.
    pub fn to_yaml(&self) -> Result<String, ProvisionError> {
        serde_yaml::to_string(self)
            .map_err(|e| ProvisionError::fetch(format!("failed to render schematic: {}", e)))
    }
}

/// Coordinates of a downloadable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCoordinates<'a> {
    pub version: &'a str,
    pub platform: &'a str,
    pub arch: &'a str,
    pub format: &'a str,
}

impl ImageCoordinates<'_> {
    pub fn file_name(&self) -> String {
        format!("{}-{}.{}", self.platform, self.arch, self.format)
    }
}

/// Derives the download URL for a schematic and image coordinates.
///
/// Pure function: no network access, same inputs give the same URL.
pub fn artifact_url(
    base: &Url,
    schematic: &SchematicId,
    image: &ImageCoordinates<'_>,
) -> Result<Url, ProvisionError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ProvisionError::Config(format!("factory url '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(["image", schematic.as_str(), image.version, &image.file_name()]);
    Ok(url)
}

/// An open artifact download.
pub struct ArtifactStream {
    /// Advertised size, when the server sent one
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

/// Remote build service that turns schematics into images.
pub trait ImageFactory {
    /// Submits a schematic document and returns its id.
    fn submit_schematic(&self, schematic_yaml: &str) -> Result<SchematicId, ProvisionError>;

    /// Starts streaming the artifact at `url`.
    fn open_artifact(&self, url: &Url) -> Result<ArtifactStream, ProvisionError>;
}

/// Source of the latest published release tag.
pub trait ReleaseSource {
    fn latest_version(&self) -> Result<String, ProvisionError>;
}
