//! Resource location: turns a request into a concrete identifier and storage.

use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::host::{HostInventory, PveHost, StorageContent, StorageTarget, VmId};
use crate::resolver::{ProvisionRequest, Workload};

/// Concrete, conflict-free target on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub vmid: VmId,
    pub storage: StorageTarget,
}

/// Lifts an untyped host failure into the typed error space.
fn host_failure(err: anyhow::Error) -> ProvisionError {
    match err.downcast::<ProvisionError>() {
        Ok(typed) => typed,
        Err(other) => ProvisionError::Execution {
            command: "host query".to_string(),
            status: format!("{:#}", other),
        },
    }
}

/// Picks a storage backend from the eligible ones.
///
/// The caller's choice wins, then `default_name`, then the first entry.
pub fn select_storage(
    eligible: &[StorageTarget],
    requested: Option<&str>,
    default_name: &str,
) -> Result<StorageTarget, ProvisionError> {
    if eligible.is_empty() {
        return Err(ProvisionError::Conflict("no eligible storage".to_string()));
    }
    if let Some(name) = requested {
        return eligible
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| {
                let names: Vec<&str> = eligible.iter().map(|s| s.name.as_str()).collect();
                ProvisionError::Conflict(format!(
                    "storage '{}' is not active or does not accept this content (eligible: {})",
                    name,
                    names.join(", ")
                ))
            });
    }
    Ok(eligible
        .iter()
        .find(|s| s.name == default_name)
        .unwrap_or(&eligible[0])
        .clone())
}

/// Queries the host to place a request.
pub struct Locator<'a> {
    host: &'a PveHost,
    default_storage: &'a str,
}

impl<'a> Locator<'a> {
    pub fn new(host: &'a PveHost, default_storage: &'a str) -> Self {
        Self {
            host,
            default_storage,
        }
    }

    /// Resolves the identifier and storage for `request`.
    ///
    /// Storage is checked first so that a host without eligible storage fails
    /// before anything is allocated. Only read-only host queries are issued.
    pub fn locate(&self, request: &ProvisionRequest) -> Result<Placement, ProvisionError> {
        let content = match request.workload {
            Workload::Talos(_) => StorageContent::Images,
            Workload::Container(_) => StorageContent::Rootdir,
        };
        let eligible = self.host.list_storage(content).map_err(host_failure)?;
        debug!(
            "storage accepting {}: {:?}",
            content,
            eligible.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );
        let storage = select_storage(&eligible, request.storage.as_deref(), self.default_storage)?;

        let vmid = match request.vmid {
            Some(id) => {
                if self.host.is_id_in_use(id).map_err(host_failure)? {
                    return Err(ProvisionError::Conflict(format!(
                        "identifier {} is already in use",
                        id
                    )));
                }
                id
            }
            None => self.host.next_id().map_err(host_failure)?,
        };

        info!("placing {} on storage {} ({})", vmid, storage.name, storage.kind);
        Ok(Placement { vmid, storage })
    }
}
