//! Capability Gate
//!
//! Decides whether the radio may be used at all. On privacy-gated platforms
//! the permissions to request depend on the radio API generation: older
//! generations gate local radio access behind location permissions, newer
//! ones have dedicated advertise/scan/connect permissions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

/// A runtime permission guarding radio use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    CoarseLocation,
    FineLocation,
    Advertise,
    Scan,
    Connect,
}

/// Radio API generation of the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioApiGeneration {
    /// Location permissions stand in for radio access.
    Legacy,
    /// Explicit advertise/scan/connect permissions.
    Modern,
    /// No runtime gating (desktop platforms, simulators).
    Unrestricted,
}

impl RadioApiGeneration {
    /// First Android SDK level with dedicated Bluetooth permissions.
    pub const MODERN_SDK_LEVEL: u32 = 31;

    pub fn from_sdk_level(level: u32) -> Self {
        if level >= Self::MODERN_SDK_LEVEL {
            RadioApiGeneration::Modern
        } else {
            RadioApiGeneration::Legacy
        }
    }

    pub fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            RadioApiGeneration::Legacy => &[Capability::CoarseLocation, Capability::FineLocation],
            RadioApiGeneration::Modern => {
                &[Capability::Advertise, Capability::Scan, Capability::Connect]
            }
            RadioApiGeneration::Unrestricted => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantResult {
    Granted,
    Denied,
}

/// Platform hook that prompts the user for a set of permissions in one go.
#[async_trait]
pub trait PermissionRequester: Send + Sync {
    async fn request(&self, capabilities: &[Capability]) -> HashMap<Capability, GrantResult>;
}

/// Requester that grants everything without prompting.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoGrant;

#[async_trait]
impl PermissionRequester for AutoGrant {
    async fn request(&self, capabilities: &[Capability]) -> HashMap<Capability, GrantResult> {
        capabilities
            .iter()
            .map(|c| (*c, GrantResult::Granted))
            .collect()
    }
}

/// Requester that grants a fixed set and denies the rest. Counts prompts.
#[derive(Debug, Default)]
pub struct FixedGrants {
    granted: HashSet<Capability>,
    prompts: AtomicUsize,
}

impl FixedGrants {
    pub fn new(granted: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionRequester for FixedGrants {
    async fn request(&self, capabilities: &[Capability]) -> HashMap<Capability, GrantResult> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        capabilities
            .iter()
            .map(|c| {
                let result = if self.granted.contains(c) {
                    GrantResult::Granted
                } else {
                    GrantResult::Denied
                };
                (*c, result)
            })
            .collect()
    }
}

pub struct CapabilityGate {
    generation: RadioApiGeneration,
    requester: Arc<dyn PermissionRequester>,
    granted: AtomicBool,
}

impl CapabilityGate {
    pub fn new(generation: RadioApiGeneration, requester: Arc<dyn PermissionRequester>) -> Self {
        Self {
            generation,
            requester,
            granted: AtomicBool::new(false),
        }
    }

    /// Gate for platforms without runtime permissions.
    pub fn unrestricted() -> Self {
        Self::new(RadioApiGeneration::Unrestricted, Arc::new(AutoGrant))
    }

    pub fn generation(&self) -> RadioApiGeneration {
        self.generation
    }

    /// Whether an earlier `acquire` succeeded.
    pub fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    /// Request every capability this generation needs in one prompt.
    ///
    /// Returns true only if all of them were granted. A success is
    /// remembered and later calls return immediately; a denial is not, so
    /// the next call prompts again.
    pub async fn acquire(&self) -> bool {
        if self.is_granted() {
            return true;
        }
        let required = self.generation.required_capabilities();
        if required.is_empty() {
            self.granted.store(true, Ordering::SeqCst);
            return true;
        }

        let results = self.requester.request(required).await;
        let denied: Vec<Capability> = required
            .iter()
            .filter(|c| results.get(c) != Some(&GrantResult::Granted))
            .copied()
            .collect();

        if denied.is_empty() {
            log::info!("Radio capabilities granted ({:?})", self.generation);
            self.granted.store(true, Ordering::SeqCst);
            true
        } else {
            log::warn!("Radio capabilities denied: {:?}", denied);
            false
        }
    }
}

impl Default for CapabilityGate {
    fn default() -> Self {
        Self::unrestricted()
    }
}
