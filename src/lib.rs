pub mod args;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod factory;
pub mod host;
pub mod interrupt;
pub mod locator;
pub mod privilege;
pub mod prompt;
pub mod resolver;
pub mod sequencer;

pub use error::ProvisionError;

use std::io::{self, IsTerminal};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, info_span, warn};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};
use uuid::Uuid;

use crate::config::Profile;
use crate::executor::CommandExecutor;
use crate::factory::{ArtifactFetcher, FactoryClient, ImageFactory, ReleaseSource, RetryPolicy};
use crate::host::PveHost;
use crate::interrupt::Interrupt;
use crate::locator::{Locator, Placement};
use crate::prompt::{NonInteractive, Prompter, WhiptailPrompter};
use crate::resolver::{Overrides, ProvisionRequest, Resolved, Resolver, Workload};
use crate::sequencer::{ContainerSequencer, ProvisionState, VmSequencer};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// How an `apply` run ended.
#[derive(Debug)]
pub enum ApplyOutcome {
    Provisioned(ProvisionState),
    /// The operator cancelled during resolution; nothing was touched
    Cancelled,
}

/// Wires resolver, locator, fetcher and sequencer for one profile.
pub struct Provisioner<'a> {
    profile: &'a Profile,
    host: PveHost,
    factory: &'a dyn ImageFactory,
    retry: Option<RetryPolicy>,
    interrupt: Interrupt,
    dry_run: bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        profile: &'a Profile,
        executor: Arc<dyn CommandExecutor>,
        factory: &'a dyn ImageFactory,
        dry_run: bool,
    ) -> Self {
        Self {
            profile,
            host: PveHost::new(executor, &profile.host),
            factory,
            retry: None,
            interrupt: Interrupt::new(),
            dry_run,
        }
    }

    /// Overrides the retry policy derived from the factory configuration.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Stops the download and further host commands once `interrupt` is raised.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.host = self.host.with_interrupt(interrupt.clone());
        self.interrupt = interrupt;
        self
    }

    pub fn host(&self) -> &PveHost {
        &self.host
    }

    /// Resolves the request, then provisions it.
    pub fn apply(
        &self,
        overrides: &Overrides,
        prompter: &dyn Prompter,
        releases: Option<&dyn ReleaseSource>,
    ) -> Result<ApplyOutcome, ProvisionError> {
        let mut resolver = Resolver::new(self.profile, overrides, prompter).with_inventory(&self.host);
        if let Some(releases) = releases {
            resolver = resolver.with_releases(releases);
        }
        let request = match resolver.resolve()? {
            Resolved::Request(request) => request,
            Resolved::Cancelled => {
                info!("cancelled by operator");
                return Ok(ApplyOutcome::Cancelled);
            }
        };
        info!("resolved request: {:?}", request);
        self.provision(&request).map(ApplyOutcome::Provisioned)
    }

    /// Places, fetches and sequences an already resolved request.
    pub fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionState, ProvisionError> {
        let placement = self.locate(request)?;
        match &request.workload {
            Workload::Talos(_) => {
                let mut fetcher = ArtifactFetcher::new(self.factory, &self.profile.factory, self.dry_run)?
                    .with_interrupt(self.interrupt.clone());
                if let Some(retry) = self.retry {
                    fetcher = fetcher.with_retry_policy(retry);
                }
                let artifact = fetcher.fetch(request)?;
                info!("image ready at {} (schematic {})", artifact.path(), artifact.schematic());
                VmSequencer::new(&self.host).provision(request, &placement, artifact.path())
            }
            Workload::Container(_) => {
                ContainerSequencer::new(&self.host).provision(request, &placement)
            }
        }
    }

    pub fn locate(&self, request: &ProvisionRequest) -> Result<Placement, ProvisionError> {
        Locator::new(&self.host, &self.profile.host.default_storage).locate(request)
    }
}

/// Picks the dialog prompter on an interactive terminal, defaults otherwise.
fn select_prompter(non_interactive: bool) -> Box<dyn Prompter> {
    if non_interactive || !io::stdin().is_terminal() {
        return Box::new(NonInteractive);
    }
    match WhiptailPrompter::new() {
        Ok(prompter) => Box::new(prompter),
        Err(e) => {
            warn!("{:#}; continuing with profile defaults", e);
            Box::new(NonInteractive)
        }
    }
}

pub fn run_apply(
    opts: &cli::ApplyArgs,
    executor: Arc<dyn CommandExecutor>,
    interrupt: Interrupt,
) -> Result<ApplyOutcome> {
    let run_id = Uuid::new_v4();
    let span = info_span!("apply", run_id = %run_id, profile = %opts.file);
    let _guard = span.enter();

    let profile = config::load_profile(opts.file.as_path())
        .with_context(|| format!("failed to load profile from {}", opts.file))?;
    profile.validate().context("profile validation failed")?;
    if opts.dry_run {
        info!("dry run: host state will not be changed");
    }

    let client = FactoryClient::new(&profile.factory)?;
    let prompter = select_prompter(opts.non_interactive);
    let overrides = Overrides::from(&opts.overrides);

    let provisioner =
        Provisioner::new(&profile, executor, &client, opts.dry_run).with_interrupt(interrupt);
    Ok(provisioner.apply(&overrides, prompter.as_ref(), Some(&client))?)
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let profile = config::load_profile(opts.file.as_path())?;
    profile.validate().context("profile validation failed")?;
    info!("validation successful:\n{:#?}", profile);
    Ok(())
}
