//! Device catalog.
//!
//! Keeps the last enumeration snapshot of a [`SpectrometerBackend`] and tracks
//! which identifiers currently have an open handle. Opening goes through
//! [`DeviceCatalog::claim`], so at most one session per identifier exists in the
//! process at any time.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{SpectroError, SpectroResult};
use crate::hardware::capabilities::{DeviceDescriptor, Spectrometer, SpectrometerBackend};

/// Enumerated instruments plus the set of open identifiers.
///
/// Cloning yields another handle to the same catalog.
#[derive(Clone)]
pub struct DeviceCatalog {
    backend: Arc<dyn SpectrometerBackend>,
    devices: Arc<RwLock<Vec<DeviceDescriptor>>>,
    open: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for DeviceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCatalog")
            .field("devices", &*self.devices.read())
            .field("open", &*self.open.lock())
            .finish()
    }
}

impl DeviceCatalog {
    /// Catalog over a backend. Starts empty; call [`refresh`](Self::refresh).
    pub fn new(backend: Arc<dyn SpectrometerBackend>) -> Self {
        Self {
            backend,
            devices: Arc::new(RwLock::new(Vec::new())),
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Re-enumerate attached instruments and replace the snapshot.
    ///
    /// Open sessions are not affected; an instrument that disappeared is only
    /// noticed by its session when a read fails.
    pub fn refresh(&self) -> SpectroResult<Vec<DeviceDescriptor>> {
        let found = self.backend.list_devices().map_err(|err| {
            warn!(error = %err, "Device enumeration failed");
            SpectroError::Enumeration(err.to_string())
        })?;
        info!(count = found.len(), "Enumerated spectrometers");
        *self.devices.write() = found.clone();
        Ok(found)
    }

    /// Devices of the last enumeration, in backend order.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.read().clone()
    }

    /// Look up an identifier in the last enumeration.
    pub fn find(&self, identifier: &str) -> Option<DeviceDescriptor> {
        self.devices
            .read()
            .iter()
            .find(|d| d.identifier == identifier)
            .cloned()
    }

    /// Whether a session currently holds the identifier.
    pub fn is_open(&self, identifier: &str) -> bool {
        self.open.lock().contains(identifier)
    }

    /// Reserve an identifier for opening.
    pub(crate) fn claim(&self, identifier: &str) -> SpectroResult<HandleClaim> {
        let descriptor = self
            .find(identifier)
            .ok_or_else(|| SpectroError::DeviceUnavailable {
                identifier: identifier.to_string(),
            })?;

        let mut open = self.open.lock();
        if !open.insert(descriptor.identifier.clone()) {
            return Err(SpectroError::DeviceBusy {
                identifier: descriptor.identifier,
            });
        }
        drop(open);

        Ok(HandleClaim {
            descriptor,
            open: Arc::clone(&self.open),
        })
    }

    pub(crate) fn open_device(&self, claim: &HandleClaim) -> anyhow::Result<Box<dyn Spectrometer>> {
        self.backend.open(&claim.descriptor)
    }
}

/// Reservation of one identifier; released on drop.
#[derive(Debug)]
pub(crate) struct HandleClaim {
    descriptor: DeviceDescriptor,
    open: Arc<Mutex<HashSet<String>>>,
}

impl HandleClaim {
    pub(crate) fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl Drop for HandleClaim {
    fn drop(&mut self) {
        self.open.lock().remove(&self.descriptor.identifier);
    }
}
