use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::CommandFactory;
use tracing::{error, info};

use pvestrap::cli::{self, Commands};
use pvestrap::executor::RealCommandExecutor;
use pvestrap::interrupt::Interrupt;
use pvestrap::{ApplyOutcome, ProvisionError};

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if let Commands::Completions(opts) = &args.command {
        let mut cmd = cli::Cli::command();
        clap_complete::generate(opts.shell, &mut cmd, env!("CARGO_PKG_NAME"), &mut io::stdout());
        return Ok(());
    }

    pvestrap::init_logging(args.command.log_level())?;

    match &args.command {
        Commands::Apply(opts) => {
            let executor = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            let interrupt = Interrupt::install()?;
            match pvestrap::run_apply(opts, executor, interrupt) {
                Ok(ApplyOutcome::Provisioned(state)) => {
                    info!("provisioning finished: {}", state);
                }
                Ok(ApplyOutcome::Cancelled) => {
                    info!("nothing was changed");
                }
                Err(e) => {
                    error!("{:#}", e);
                    if let Some(state) = e.downcast_ref::<ProvisionError>().and_then(|p| p.state()) {
                        error!("state at failure: {}", state);
                    }
                    process::exit(1);
                }
            }
        }
        Commands::Validate(opts) => {
            if let Err(e) = pvestrap::run_validate(opts) {
                error!("{:#}", e);
                process::exit(1);
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}
