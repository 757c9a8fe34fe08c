//! Simulated device fleet.

use serde::{Deserialize, Serialize};

/// A simulated wearable in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Tenant the device reports under
    pub tenant_id: String,

    /// Unique device identifier (e.g., "watch-0001")
    pub id: String,

    /// Position in the fleet, used to derive per-device seeds
    pub index: usize,
}

impl Device {
    /// Returns the seed for this device's generator given a run seed.
    pub fn seed(&self, run_seed: u64) -> u64 {
        run_seed.wrapping_add(self.index as u64)
    }
}

/// Formats the identifier for the device at `index`.
pub fn device_id(index: usize) -> String {
    format!("watch-{:04}", index)
}

/// Generates a fleet of `count` devices for a tenant.
pub fn generate_fleet(tenant_id: &str, count: usize) -> Vec<Device> {
    (0..count)
        .map(|index| Device {
            tenant_id: tenant_id.to_string(),
            id: device_id(index),
            index,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_fleet() {
        let fleet = generate_fleet("acme-clinic", 100);
        assert_eq!(fleet.len(), 100);

        for (i, device) in fleet.iter().enumerate() {
            assert_eq!(device.id, format!("watch-{:04}", i));
            assert_eq!(device.tenant_id, "acme-clinic");
        }

        let ids: HashSet<_> = fleet.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_large_fleet_ids_stay_unique() {
        let fleet = generate_fleet("t", 12_000);
        let ids: HashSet<_> = fleet.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids.len(), 12_000);
        assert_eq!(fleet[11_999].id, "watch-11999");
    }

    #[test]
    fn test_device_seed() {
        let fleet = generate_fleet("t", 3);
        assert_eq!(fleet[2].seed(40), 42);
        assert_eq!(fleet[1].seed(u64::MAX), 0);
    }
}
