//! LXC container provisioning steps.

use crate::args::{CommandArgsBuilder, PropertyString};
use crate::error::ProvisionError;
use crate::host::{HostInventory, PveHost};
use crate::locator::Placement;
use crate::resolver::{ContainerRequest, ProvisionRequest, Workload};

use super::{ProvisionState, Step};

/// Builds the `pct create` options (everything after the template).
pub fn create_options(
    request: &ProvisionRequest,
    container: &ContainerRequest,
    placement: &Placement,
) -> Vec<String> {
    let rootfs = format!("{}:{}", placement.storage.name, request.shape.disk_gib);
    let net0 = PropertyString::new("name=eth0")
        .set("bridge", &request.network.bridge)
        .set("ip", "dhcp")
        .set_opt("tag", request.network.vlan)
        .set_opt("mtu", request.network.mtu);

    let mut builder = CommandArgsBuilder::new();
    builder
        .push_flag_value("--hostname", &request.name)
        .push_flag_value("--cores", request.shape.cores)
        .push_flag_value("--memory", request.shape.memory_mib)
        .push_flag_value("--rootfs", rootfs)
        .push_flag_value("--net0", net0)
        .push_bool("--unprivileged", container.unprivileged)
        .push_bool("--onboot", container.onboot);
    if container.nesting {
        builder.push_flag_value("--features", PropertyString::empty().set("nesting", 1));
    }
    builder.into_args()
}

/// Runs the container provisioning steps against a host.
pub struct ContainerSequencer<'a> {
    host: &'a PveHost,
}

impl<'a> ContainerSequencer<'a> {
    pub fn new(host: &'a PveHost) -> Self {
        Self { host }
    }

    pub fn provision(
        &self,
        request: &ProvisionRequest,
        placement: &Placement,
    ) -> Result<ProvisionState, ProvisionError> {
        let Workload::Container(container) = &request.workload else {
            return Err(ProvisionError::Validation(
                "container sequencer requires a container workload".to_string(),
            ));
        };
        let host = self.host;
        let id = placement.vmid;
        let mut state = ProvisionState::new(id);

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
        host.create_container(id, &container.template, create_options(request, container, placement))
            .map_err(|e| state.failed(Step::CreateResource, e))?;
        state.completed(
            Step::CreateResource,
            format!("created container {} '{}' from {}", id, request.name, container.template),
        );

        if !request.start {
            state.skipped(Step::Start, "start not requested");
            return Ok(state);
        }
        host.start_container(id)
            .map_err(|e| state.failed(Step::Start, e))?;
        state.completed(Step::Start, format!("started container {}", id));

        if container.setup.is_empty() {
            state.skipped(Step::RunSetup, "no setup commands");
        }
        for command in &container.setup {
            host.exec_in_container(id, command)
                .map_err(|e| state.failed(Step::RunSetup, e))?;
            state.completed(Step::RunSetup, command.clone());
        }

        Ok(state)
    }
}
