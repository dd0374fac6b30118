mod helpers;

use std::fs;

use anyhow::Result;
use camino::Utf8Path;
use pvestrap::ProvisionError;
use pvestrap::config::{Firmware, WorkloadKind, load_profile, parse_profile};
use pvestrap::privilege::PrivilegeMethod;

#[test]
fn test_load_talos_demo_profile() -> Result<()> {
    let profile = load_profile(Utf8Path::new("demos/talos.yaml"))?;
    profile.validate()?;

    assert_eq!(profile.kind, WorkloadKind::Talos);
    assert_eq!(profile.defaults.name.as_deref(), Some("talos-cp-1"));
    assert_eq!(profile.defaults.cores, 4);
    assert_eq!(profile.defaults.vlan, Some(0));
    assert_eq!(profile.talos.firmware, Firmware::Ovmf);
    assert_eq!(profile.talos.extensions.len(), 2);
    assert!(profile.container.is_none());

    Ok(())
}

#[test]
fn test_load_container_demo_profile() -> Result<()> {
    let profile = load_profile(Utf8Path::new("demos/etesync.yaml"))?;
    profile.validate()?;

    assert_eq!(profile.kind, WorkloadKind::Container);
    let container = profile.container.expect("container section");
    assert!(container.unprivileged);
    assert!(container.onboot);
    assert_eq!(container.setup.len(), 5);

    Ok(())
}

#[test]
fn test_load_profile_from_file_with_host_section() -> Result<()> {
    let (_dir, path) = helpers::scratch_dir();
    let file = path.join("profile.yaml");
    // editorconfig-checker-disable
    fs::write(
        &file,
        r#"---
defaults:
  vmid: 250
  storage: ceph
talos:
  version: v1.9.0
  schematic: ce4c980550dd2ab1b17bbf2b08801c7eb59418eafe8f279833297925d67c7515
host:
  privilege: sudo
  command_timeout_secs: 60
"#,
    )?;
    // editorconfig-checker-enable

    let profile = load_profile(&file)?;
    profile.validate()?;
    assert_eq!(profile.defaults.vmid, Some(250));
    assert_eq!(profile.defaults.storage.as_deref(), Some("ceph"));
    assert_eq!(profile.host.privilege, Some(PrivilegeMethod::Sudo));
    assert_eq!(profile.host.command_timeout_secs, 60);
    assert_eq!(profile.host.import_timeout_secs, 3600);

    Ok(())
}

#[test]
fn test_missing_file_is_io_error() {
    let err = load_profile(Utf8Path::new("does/not/exist.yaml")).unwrap_err();
    assert!(matches!(err, ProvisionError::Io { .. }), "got {:?}", err);
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_unknown_section_is_rejected() {
    let err = parse_profile("cluster:\n  nodes: 3\n").unwrap_err();
    assert!(matches!(err, ProvisionError::Config(_)));
}

#[test]
fn test_zero_retries_is_rejected() {
    let profile = parse_profile("factory:\n  retries: 0\n").unwrap();
    let err = profile.validate().unwrap_err();
    assert!(err.to_string().contains("factory.retries"));
}

#[test]
fn test_zero_timeout_is_rejected() {
    let profile = parse_profile("host:\n  import_timeout_secs: 0\n").unwrap();
    assert!(profile.validate().is_err());
}
