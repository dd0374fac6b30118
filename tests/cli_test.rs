use anyhow::Result;
use clap::Parser;
use pvestrap::cli::{Cli, Commands, LogLevel};
use pvestrap::config::Firmware;
use pvestrap::resolver::Overrides;

#[test]
fn test_parse_apply_command() -> Result<()> {
    let args = Cli::parse_from(["pvestrap", "apply", "--file", "talos.yaml"]);

    match args.command {
        Commands::Apply(opts) => {
            assert_eq!(opts.file, "talos.yaml");
            assert!(!opts.dry_run);
            assert!(!opts.non_interactive);
            assert_eq!(opts.log_level, LogLevel::Info);
            assert_eq!(Overrides::from(&opts.overrides), Overrides::default());
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_parse_apply_command_with_overrides() -> Result<()> {
    let args = Cli::parse_from([
        "pvestrap",
        "apply",
        "-f",
        "talos.yaml",
        "--dry-run",
        "--non-interactive",
        "--log-level",
        "debug",
        "--vmid",
        "150",
        "--name",
        "talos-cp-1",
        "--cores",
        "4",
        "--memory",
        "8192",
        "--disk",
        "32",
        "--vlan",
        "0",
        "--storage",
        "local-lvm",
        "--talos-version",
        "v1.9.0",
        "--firmware",
        "seabios",
        "--guest-agent",
        "false",
        "--start",
        "true",
    ]);

    match args.command {
        Commands::Apply(opts) => {
            assert!(opts.dry_run);
            assert!(opts.non_interactive);
            assert_eq!(opts.log_level, LogLevel::Debug);
            let overrides = Overrides::from(&opts.overrides);
            assert_eq!(overrides.vmid, Some(150));
            assert_eq!(overrides.name.as_deref(), Some("talos-cp-1"));
            assert_eq!(overrides.cores, Some(4));
            assert_eq!(overrides.memory, Some(8192));
            assert_eq!(overrides.disk, Some(32));
            assert_eq!(overrides.vlan, Some(0));
            assert_eq!(overrides.storage.as_deref(), Some("local-lvm"));
            assert_eq!(overrides.version.as_deref(), Some("v1.9.0"));
            assert_eq!(overrides.firmware, Some(Firmware::Seabios));
            assert_eq!(overrides.guest_agent, Some(false));
            assert_eq!(overrides.start, Some(true));
        }
        _ => panic!("Expected Apply command"),
    }

    Ok(())
}

#[test]
fn test_invalid_firmware_is_rejected() {
    let result = Cli::try_parse_from(["pvestrap", "apply", "--firmware", "uefi"]);
    assert!(result.is_err());
}

#[test]
fn test_parse_validate_command() -> Result<()> {
    let args = Cli::parse_from(["pvestrap", "validate", "--file", "etesync.yaml"]);

    match args.command {
        Commands::Validate(opts) => {
            assert_eq!(opts.file, "etesync.yaml");
            assert_eq!(opts.log_level, LogLevel::Info);
        }
        _ => panic!("Expected Validate command"),
    }

    Ok(())
}

#[test]
fn test_verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}
