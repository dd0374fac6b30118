mod helpers;

use std::sync::Arc;

use anyhow::Result;
use helpers::{
    Answer, FakeFactory, IMPORT_OUTPUT, PVESM_EMPTY, RESOURCES_EMPTY, ScriptedExecutor,
    ScriptedPrompter,
};
use pvestrap::executor::CommandExecutor;
use pvestrap::factory::RetryPolicy;
use pvestrap::interrupt::Interrupt;
use pvestrap::prompt::NonInteractive;
use pvestrap::resolver::Overrides;
use pvestrap::sequencer::Step;
use pvestrap::{ApplyOutcome, ProvisionError, Provisioner, cli, run_apply, run_validate};

const LOCAL_LVM_ONLY: &str = "\
Name             Type     Status           Total            Used       Available        %
local-lvm     lvmthin     active       832888832        20535414       812353417    2.47%
";

fn apply_args(file: &str) -> cli::ApplyArgs {
    cli::ApplyArgs {
        file: file.into(),
        log_level: cli::LogLevel::Error,
        dry_run: true,
        non_interactive: true,
        overrides: cli::OverrideArgs::default(),
    }
}

#[test]
fn end_to_end_talos_records_all_nine_steps() -> Result<()> {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch.clone());
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("pvesm status", LOCAL_LVM_ONLY)
            .on("pvesh get /cluster/resources", RESOURCES_EMPTY)
            .on("pvesh get /cluster/nextid", "101\n")
            .on("qm importdisk", IMPORT_OUTPUT),
    );
    let factory = FakeFactory::new();
    let provisioner = Provisioner::new(&profile, executor.clone(), &factory, false);

    let overrides = Overrides {
        guest_agent: Some(true),
        ..Overrides::default()
    };
    let outcome = provisioner.apply(&overrides, &NonInteractive, None)?;

    let ApplyOutcome::Provisioned(state) = outcome else {
        panic!("expected Provisioned, got {:?}", outcome);
    };
    assert_eq!(state.vmid().get(), 101);
    assert_eq!(
        state.completed_steps(),
        vec![
            Step::CreateResource,
            Step::AttachFirmware,
            Step::ImportDisk,
            Step::ResolveVolume,
            Step::AttachDisk,
            Step::ResizeDisk,
            Step::SetBootOrder,
            Step::EnableGuestAgent,
            Step::Start,
        ]
    );
    assert_eq!(state.records().len(), 9);
    assert_eq!(factory.submitted.borrow().len(), 1);
    assert_eq!(factory.downloads.borrow().len(), 1);
    assert_eq!(helpers::entries(&scratch), 0, "scratch directory must be removed");
    Ok(())
}

#[test]
fn end_to_end_empty_storage_halts_at_locate() {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch.clone());
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("pvesm status", PVESM_EMPTY)
            .on("pvesh get /cluster/resources", RESOURCES_EMPTY)
            .on("pvesh get /cluster/nextid", "101\n"),
    );
    let factory = FakeFactory::new();
    let provisioner = Provisioner::new(&profile, executor.clone(), &factory, false);

    let err = provisioner
        .apply(&Overrides::default(), &NonInteractive, None)
        .unwrap_err();

    assert!(matches!(&err, ProvisionError::Conflict(msg) if msg == "no eligible storage"));
    assert!(err.state().is_none());
    assert_eq!(factory.network_calls(), 0);
    assert!(executor.mutating_calls().is_empty());
    assert_eq!(helpers::entries(&scratch), 0);
}

#[test]
fn fetch_failure_leaves_host_untouched() {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch.clone());
    let executor = Arc::new(ScriptedExecutor::healthy_host());
    let factory = FakeFactory::new().failing_submit(ProvisionError::Fetch {
        message: "connection refused".to_string(),
        retryable: true,
    });
    let provisioner = Provisioner::new(&profile, executor.clone(), &factory, false)
        .with_retry_policy(RetryPolicy::none());

    let err = provisioner
        .apply(&Overrides::default(), &NonInteractive, None)
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Fetch { .. }), "got {:?}", err);
    assert!(executor.mutating_calls().is_empty());
    assert_eq!(helpers::entries(&scratch), 0);
}

#[test]
fn step_failure_carries_state() {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch.clone());
    let executor = Arc::new(ScriptedExecutor::healthy_host().fail("qm importdisk", 5, "storage full"));
    let factory = FakeFactory::new();
    let provisioner = Provisioner::new(&profile, executor.clone(), &factory, false);

    let err = provisioner
        .apply(&Overrides::default(), &NonInteractive, None)
        .unwrap_err();

    let state = err.state().expect("step errors carry state");
    assert_eq!(
        state.completed_steps(),
        vec![Step::CreateResource, Step::AttachFirmware]
    );
    assert!(err.to_string().starts_with("step 'import-disk' failed for resource 101"));
    assert_eq!(helpers::entries(&scratch), 0);
}

#[test]
fn raised_interrupt_stops_before_any_host_command() {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch.clone());
    let executor = Arc::new(ScriptedExecutor::healthy_host());
    let factory = FakeFactory::new();
    let interrupt = Interrupt::new();
    let provisioner =
        Provisioner::new(&profile, executor.clone(), &factory, false).with_interrupt(interrupt.clone());

    interrupt.trigger();
    let err = provisioner
        .apply(&Overrides::default(), &NonInteractive, None)
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Interrupted(_)), "got {:?}", err);
    assert!(executor.calls().is_empty());
    assert_eq!(factory.network_calls(), 0);
    assert_eq!(helpers::entries(&scratch), 0);
}

#[test]
fn operator_cancel_is_clean() -> Result<()> {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch);
    let executor = Arc::new(ScriptedExecutor::healthy_host());
    let factory = FakeFactory::new();
    let provisioner = Provisioner::new(&profile, executor.clone(), &factory, false);
    let prompter = ScriptedPrompter::new([Answer::Cancel]);

    let outcome = provisioner.apply(&Overrides::default(), &prompter, None)?;

    assert!(matches!(outcome, ApplyOutcome::Cancelled));
    assert!(executor.calls().is_empty());
    assert_eq!(factory.network_calls(), 0);
    Ok(())
}

#[test]
fn dry_run_resolves_schematic_but_skips_download() -> Result<()> {
    let (_dir, scratch) = helpers::scratch_dir();
    let profile = helpers::talos_profile(scratch);
    let executor = Arc::new(
        ScriptedExecutor::dry_run()
            .on("pvesm status", LOCAL_LVM_ONLY)
            .on("pvesh get /cluster/resources", RESOURCES_EMPTY)
            .on("pvesh get /cluster/nextid", "101\n"),
    );
    let factory = FakeFactory::new();
    let outcome = Provisioner::new(&profile, executor.clone(), &factory, true).apply(
        &Overrides::default(),
        &NonInteractive,
        None,
    )?;

    assert!(matches!(outcome, ApplyOutcome::Provisioned(_)));
    assert_eq!(factory.submitted.borrow().len(), 1);
    assert!(factory.downloads.borrow().is_empty(), "dry run must not download");
    assert_eq!(executor.count("qm config"), 0);
    assert_eq!(executor.count("qm importdisk 101"), 1);
    Ok(())
}

#[test]
fn run_apply_dry_run_container_profile() -> Result<()> {
    let executor = Arc::new(
        ScriptedExecutor::dry_run()
            .on("pvesm status", LOCAL_LVM_ONLY)
            .on("pvesh get /cluster/resources", RESOURCES_EMPTY)
            .on("pvesh get /cluster/nextid", "130\n"),
    );

    let outcome = run_apply(&apply_args("demos/etesync.yaml"), executor.clone(), Interrupt::new())?;

    let ApplyOutcome::Provisioned(state) = outcome else {
        panic!("expected Provisioned");
    };
    assert_eq!(state.vmid().get(), 130);
    let mutating = executor.mutating_calls();
    assert!(mutating[0].starts_with("pct create 130"));
    assert_eq!(mutating[1], "pct start 130");
    assert_eq!(mutating.len(), 2 + 5);
    Ok(())
}

#[test]
fn run_apply_fails_for_missing_profile() {
    let executor: Arc<dyn CommandExecutor> = Arc::new(ScriptedExecutor::new());
    let err = run_apply(&apply_args("demos/missing.yaml"), executor, Interrupt::new()).unwrap_err();
    assert!(format!("{:#}", err).contains("failed to load profile"));
}

#[test]
fn run_validate_succeeds_on_demo_profiles() {
    for file in ["demos/talos.yaml", "demos/etesync.yaml"] {
        let opts = cli::ValidateArgs {
            file: file.into(),
            log_level: cli::LogLevel::Error,
        };
        run_validate(&opts).unwrap_or_else(|e| panic!("{} should validate: {:#}", file, e));
    }
}
