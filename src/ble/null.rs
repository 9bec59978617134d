//! Radio provider for platforms or builds without BLE support.

use std::sync::Arc;

use super::transport::{BleCentral, BlePeripheral, RadioProvider};

/// A radio that offers neither role. Every proximity component built on
/// it runs in its degraded mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRadio;

impl RadioProvider for NullRadio {
    fn name(&self) -> &'static str {
        "null"
    }

    fn central(&self) -> Option<Arc<dyn BleCentral>> {
        None
    }

    fn peripheral(&self) -> Option<Arc<dyn BlePeripheral>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_radio_has_no_roles() {
        let caps = NullRadio.capabilities();
        assert!(!caps.central);
        assert!(!caps.peripheral);
    }
}
