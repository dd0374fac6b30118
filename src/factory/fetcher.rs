//! Remote artifact fetcher.
//!
//! Drives the fetch state machine
//! `NoDescriptor → DescriptorResolved → Downloading → Ready` (or `Failed`
//! from any state) and owns the scoped scratch directory the image lands in.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use strum::Display;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    GUEST_AGENT_EXTENSION, ImageCoordinates, ImageFactory, Schematic, SchematicId, artifact_url,
};
use crate::config::FactoryConfig;
use crate::error::ProvisionError;
use crate::interrupt::Interrupt;
use crate::resolver::{ProvisionRequest, Workload};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Bounded exponential backoff for transient network failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FactoryConfig) -> Self {
        Self {
            attempts: config.retries.max(1),
            initial_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_secs(30),
        }
    }

    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op`, retrying retryable failures according to `policy`.
///
/// Non-retryable errors and the error of the last attempt are returned as is.
pub fn with_retry<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, ProvisionError>,
) -> Result<T, ProvisionError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, policy.attempts, delay, e
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stage at which a fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FetchStage {
    Scratch,
    ResolveDescriptor,
    DeriveUrl,
    Download,
}

/// Progress of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    NoDescriptor,
    DescriptorResolved { schematic: SchematicId },
    Downloading { url: Url },
    Ready { path: Utf8PathBuf },
    Failed { stage: FetchStage },
}

/// A downloaded image inside its scratch directory.
///
/// The scratch directory is removed when this value is dropped.
#[derive(Debug)]
pub struct LocalArtifact {
    scratch: TempDir,
    path: Utf8PathBuf,
    url: Url,
    schematic: SchematicId,
    size: u64,
}

impl LocalArtifact {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn schematic(&self) -> &SchematicId {
        &self.schematic
    }

    /// Bytes written; 0 for dry runs.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn scratch_dir(&self) -> &std::path::Path {
        self.scratch.path()
    }
}

/// Free bytes available to unprivileged writers on the filesystem of `dir`.
fn available_space(dir: &Utf8Path) -> Result<u64, ProvisionError> {
    let stat = rustix::fs::statvfs(dir.as_std_path()).map_err(|e| {
        ProvisionError::io(format!("failed to stat filesystem of {}", dir), io::Error::from(e))
    })?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

/// Resolves schematics and downloads images into scoped scratch storage.
pub struct ArtifactFetcher<'a> {
    factory: &'a dyn ImageFactory,
    config: &'a FactoryConfig,
    base: Url,
    retry: RetryPolicy,
    dry_run: bool,
    interrupt: Interrupt,
    state: FetchState,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(
        factory: &'a dyn ImageFactory,
        config: &'a FactoryConfig,
        dry_run: bool,
    ) -> Result<Self, ProvisionError> {
        let base = Url::parse(&config.url).map_err(|e| {
            ProvisionError::Config(format!("invalid factory.url '{}': {}", config.url, e))
        })?;
        Ok(Self {
            factory,
            config,
            base,
            retry: RetryPolicy::from_config(config),
            dry_run,
            interrupt: Interrupt::new(),
            state: FetchState::NoDescriptor,
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Aborts the download once `interrupt` is raised.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn state(&self) -> &FetchState {
        &self.state
    }

    fn transition(&mut self, next: FetchState) {
        debug!("fetch state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Fetches the image described by `request` into a fresh scratch directory.
    pub fn fetch(&mut self, request: &ProvisionRequest) -> Result<LocalArtifact, ProvisionError> {
        let mut stage = FetchStage::Scratch;
        let result = self.fetch_inner(request, &mut stage);
        if result.is_err() {
            self.transition(FetchState::Failed { stage });
        }
        result
    }

    fn fetch_inner(
        &mut self,
        request: &ProvisionRequest,
        stage: &mut FetchStage,
    ) -> Result<LocalArtifact, ProvisionError> {
        let Workload::Talos(talos) = &request.workload else {
            return Err(ProvisionError::Validation(
                "artifact fetch requires a talos workload".to_string(),
            ));
        };

        let config = self.config;
        let scratch = self.create_scratch()?;

        *stage = FetchStage::ResolveDescriptor;
        let schematic = match &talos.schematic {
            Some(known) => {
                info!("using configured schematic {}", known);
                if request.features.guest_agent {
                    warn!(
                        "guest agent requested but schematic {} is not built here; \
                        make sure it includes {}",
                        known, GUEST_AGENT_EXTENSION
                    );
                }
                known.clone()
            }
            None => {
                let document = Schematic::new(
                    request.features.guest_agent,
                    &talos.extensions,
                    &talos.kernel_args,
                )
                .to_yaml()?;
                let id = with_retry(self.retry, "schematic submission", || {
                    self.factory.submit_schematic(&document)
                })?;
                info!("resolved schematic {}", id);
                id
            }
        };
        self.transition(FetchState::DescriptorResolved {
            schematic: schematic.clone(),
        });

        *stage = FetchStage::DeriveUrl;
        let image = ImageCoordinates {
            version: &talos.version,
            platform: &config.platform,
            arch: &config.arch,
            format: &config.format,
        };
        let url = artifact_url(&self.base, &schematic, &image)?;
        let scratch_path = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
            ProvisionError::Config(format!(
                "scratch path is not valid UTF-8: {}",
                scratch.path().display()
            ))
        })?;
        let path = scratch_path.join(image.file_name());

        *stage = FetchStage::Download;
        self.transition(FetchState::Downloading { url: url.clone() });
        let size = if self.dry_run {
            info!("dry run: skipping download of {}", url);
            0
        } else {
            info!("downloading {} to {}", url, path);
            let size = with_retry(self.retry, "image download", || self.download(&url, &path))?;
            info!("downloaded {} bytes", size);
            size
        };

        self.transition(FetchState::Ready { path: path.clone() });
        Ok(LocalArtifact {
            scratch,
            path,
            url,
            schematic,
            size,
        })
    }

    fn create_scratch(&self) -> Result<TempDir, ProvisionError> {
        let root = self.config.scratch_root()?;
        fs::create_dir_all(&root)
            .map_err(|e| ProvisionError::io(format!("failed to create {}", root), e))?;
        let dir = tempfile::Builder::new()
            .prefix("pvestrap-")
            .tempdir_in(&root)
            .map_err(|e| ProvisionError::io(format!("failed to create scratch dir in {}", root), e))?;
        debug!("scratch directory: {}", dir.path().display());
        Ok(dir)
    }

    /// Streams one download attempt into `path`, truncating earlier attempts.
    fn download(&self, url: &Url, path: &Utf8Path) -> Result<u64, ProvisionError> {
        let mut stream = self.factory.open_artifact(url)?;

        if let Some(expected) = stream.content_length {
            let parent = path.parent().unwrap_or(path);
            let available = available_space(parent)?;
            if available < expected {
                return Err(ProvisionError::fetch(format!(
                    "image {} needs {} bytes but only {} are free in {}",
                    url, expected, available, parent
                )));
            }
        }

        let file = File::create(path)
            .map_err(|e| ProvisionError::io(format!("failed to create {}", path), e))?;
        let mut writer = BufWriter::new(file);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            self.interrupt
                .check(|| format!("download of {} cancelled after {} bytes", url, written))?;
            let n = match stream.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ProvisionError::Fetch {
                        message: format!("GET {} interrupted: {}", url, e),
                        retryable: true,
                    });
                }
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| ProvisionError::io(format!("failed to write {}", path), e))?;
            written += n as u64;
        }
        writer
            .flush()
            .map_err(|e| ProvisionError::io(format!("failed to flush {}", path), e))?;

        if let Some(expected) = stream.content_length
            && written != expected
        {
            return Err(ProvisionError::Fetch {
                message: format!(
                    "GET {} truncated: received {} of {} bytes",
                    url, written, expected
                ),
                retryable: true,
            });
        }
        if written == 0 {
            return Err(ProvisionError::fetch(format!("GET {} returned an empty body", url)));
        }
        Ok(written)
    }
}
