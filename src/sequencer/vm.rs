//! Talos VM provisioning steps.

use anyhow::anyhow;
use camino::Utf8Path;
use tracing::debug;

use super::{ProvisionState, Step, VolumeResolution, resolve_volume};
use crate::args::{CommandArgsBuilder, PropertyString};
use crate::config::Firmware;
use crate::error::ProvisionError;
use crate::host::{HostInventory, PveHost, StorageTarget, VmId};
use crate::locator::Placement;
use crate::resolver::{ProvisionRequest, TalosRequest, Workload};

/// Bus slot of the primary disk.
pub const PRIMARY_DISK: &str = "scsi0";

/// Builds the `qm create` options for a Talos VM.
pub fn create_options(request: &ProvisionRequest, talos: &TalosRequest) -> Vec<String> {
    let net0 = PropertyString::new("virtio")
        .set("bridge", &request.network.bridge)
        .set_opt("tag", request.network.vlan)
        .set_opt("mtu", request.network.mtu);

    let mut builder = CommandArgsBuilder::new();
    builder
        .push_flag_value("--name", &request.name)
        .push_flag_value("--cores", request.shape.cores)
        .push_flag_value("--memory", request.shape.memory_mib)
        .push_flag_value("--cpu", "host")
        .push_flag_value("--ostype", "l26")
        .push_flag_value("--scsihw", "virtio-scsi-single")
        .push_flag_value("--net0", net0)
        .push_flag_value("--bios", talos.firmware)
        .push_flag_value("--agent", "enabled=0");
    if talos.firmware == Firmware::Ovmf {
        builder.push_flag_value("--machine", "q35");
    }
    builder.into_args()
}

/// EFI vars disk on `storage`, without pre-enrolled Secure Boot keys.
pub fn efidisk_option(storage: &StorageTarget) -> String {
    PropertyString::new(format!("{}:1", storage.name))
        .set("efitype", "4m")
        .set("pre-enrolled-keys", 0)
        .to_string()
}

/// Drive definition for the imported volume on a storage of the given kind.
pub fn primary_disk_option(volume: &str, storage: &StorageTarget) -> String {
    storage
        .kind
        .disk_options()
        .iter()
        .fold(PropertyString::new(volume), |p, (k, v)| p.set(k, v))
        .to_string()
}

/// Volume name `qm importdisk` would allocate first on `storage`.
fn predicted_volume(id: VmId, storage: &StorageTarget) -> String {
    format!("{}:vm-{}-disk-0", storage.name, id)
}

/// Runs the VM provisioning steps against a host.
pub struct VmSequencer<'a> {
    host: &'a PveHost,
}

impl<'a> VmSequencer<'a> {
    pub fn new(host: &'a PveHost) -> Self {
        Self { host }
    }

    /// Provisions a Talos VM from the downloaded `image`.
    pub fn provision(
        &self,
        request: &ProvisionRequest,
        placement: &Placement,
        image: &Utf8Path,
    ) -> Result<ProvisionState, ProvisionError> {
        let Workload::Talos(talos) = &request.workload else {
            return Err(ProvisionError::Validation(
                "VM sequencer requires a talos workload".to_string(),
            ));
        };
        let host = self.host;
        let id = placement.vmid;
        let storage = &placement.storage;
        let mut state = ProvisionState::new(id);

        // 1. Recheck the identifier right before creating.
        match host.is_id_in_use(id) {
            Ok(false) => {}
            Ok(true) => {
                return Err(state.failed(
                    Step::CreateResource,
                    ProvisionError::Conflict(format!("identifier {} is already in use", id)),
                ));
            }
            Err(e) => return Err(state.failed(Step::CreateResource, e)),
        }
        host.create_vm(id, create_options(request, talos))
            .map_err(|e| state.failed(Step::CreateResource, e))?;
        state.completed(Step::CreateResource, format!("created VM {} '{}'", id, request.name));

        // 2. Firmware volume.
        match talos.firmware {
            Firmware::Ovmf => {
                let efidisk = efidisk_option(storage);
                host.set_vm_options(id, vec!["--efidisk0".to_string(), efidisk.clone()])
                    .map_err(|e| state.failed(Step::AttachFirmware, e))?;
                state.completed(Step::AttachFirmware, format!("efidisk0 {}", efidisk));
            }
            Firmware::Seabios => state.skipped(Step::AttachFirmware, "seabios needs no EFI disk"),
        }

        // 3. Import.
        let import = host
            .import_disk(id, image, storage)
            .map_err(|e| state.failed(Step::ImportDisk, e))?;
        state.completed(Step::ImportDisk, format!("imported {} into {}", image, storage.name));

        // 4. Find the imported volume.
        let volume = if import.is_dry_run() {
            let volume = predicted_volume(id, storage);
            state.skipped(Step::ResolveVolume, format!("dry run, assuming {}", volume));
            volume
        } else {
            let config = host
                .vm_config(id)
                .map_err(|e| state.failed(Step::ResolveVolume, e))?;
            match resolve_volume(&import.stdout, &config) {
                VolumeResolution::FoundDirect(volume) => {
                    state.completed(Step::ResolveVolume, format!("{} (from import output)", volume));
                    volume
                }
                VolumeResolution::FoundFallback(volume) => {
                    state.completed(Step::ResolveVolume, format!("{} (from unused slot)", volume));
                    volume
                }
                VolumeResolution::NotFound => {
                    return Err(state.failed(
                        Step::ResolveVolume,
                        anyhow!("import produced no discoverable volume"),
                    ));
                }
            }
        };

        // 5. Attach as primary disk and drop any leftover unused reference.
        let drive = primary_disk_option(&volume, storage);
        host.set_vm_options(id, vec![format!("--{}", PRIMARY_DISK), drive.clone()])
            .map_err(|e| state.failed(Step::AttachDisk, e))?;
        if !import.is_dry_run() {
            let config = host
                .vm_config(id)
                .map_err(|e| state.failed(Step::AttachDisk, e))?;
            if let Some(slot) = config.unused_slot_for(&volume) {
                debug!("removing leftover {} for {}", slot, volume);
                host.delete_unused(id, &slot)
                    .map_err(|e| state.failed(Step::AttachDisk, e))?;
            }
        }
        state.completed(Step::AttachDisk, format!("{}: {}", PRIMARY_DISK, drive));

        // 6. Resize, best effort.
        match host.resize_disk(id, PRIMARY_DISK, request.shape.disk_gib) {
            Ok(()) => state.completed(
                Step::ResizeDisk,
                format!("{} resized to {}G", PRIMARY_DISK, request.shape.disk_gib),
            ),
            Err(e) => state.degraded(Step::ResizeDisk, &e),
        }

        // 7. Boot order.
        host.set_boot_order(id, PRIMARY_DISK)
            .map_err(|e| state.failed(Step::SetBootOrder, e))?;
        state.completed(Step::SetBootOrder, format!("order={}", PRIMARY_DISK));

        // 8. Guest agent, best effort.
        if request.features.guest_agent {
            match host.set_vm_options(id, vec!["--agent".to_string(), "enabled=1".to_string()]) {
                Ok(()) => state.completed(Step::EnableGuestAgent, "agent enabled=1"),
                Err(e) => state.degraded(Step::EnableGuestAgent, &e),
            }
        } else {
            state.skipped(Step::EnableGuestAgent, "guest agent not requested");
        }

        // 9. Start.
        if request.start {
            host.start_vm(id).map_err(|e| state.failed(Step::Start, e))?;
            state.completed(Step::Start, format!("started VM {}", id));
        } else {
            state.skipped(Step::Start, "start not requested");
        }

        Ok(state)
    }
}
