//! Cooperative handling of SIGINT, SIGTERM and SIGQUIT.
//!
//! The first signal only raises a flag. The image download and the host
//! adapter check it and return [`ProvisionError::Interrupted`], so the run
//! unwinds through its normal return path and the scratch directory is
//! removed. A second signal terminates the process immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use crate::error::ProvisionError;

/// Exit status of the forced exit on a repeated signal.
const FORCED_EXIT_STATUS: i32 = 130;

/// Shared "stop as soon as possible" flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// A flag that is only raised through [`Interrupt::trigger`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a flag raised by the termination signals.
    pub fn install() -> Result<Self> {
        let interrupt = Self::new();
        for &signal in TERM_SIGNALS {
            // Registered first so it only fires once the flag is already set.
            flag::register_conditional_shutdown(signal, FORCED_EXIT_STATUS, Arc::clone(&interrupt.0))
                .with_context(|| format!("failed to register shutdown for signal {}", signal))?;
            flag::register(signal, Arc::clone(&interrupt.0))
                .with_context(|| format!("failed to register handler for signal {}", signal))?;
        }
        Ok(interrupt)
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with `Interrupted` once the flag is raised.
    pub fn check(&self, what: impl FnOnce() -> String) -> Result<(), ProvisionError> {
        if self.is_set() {
            return Err(ProvisionError::Interrupted(what()));
        }
        Ok(())
    }
}
