use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sysinfo::System;

/// A single logical CPU as recorded in the result files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDescriptor {
    pub model: String,
    pub mhz: u64,
}

/// Fingerprint of the benchmarking host.
///
/// Result histories from different machines are kept separate by keying the
/// on-disk partitions with `id()`. Equality over the full descriptor list is
/// only ever used to warn about partitions recorded on another machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemIdentity {
    pub cpus: Vec<CpuDescriptor>,
}

impl SystemIdentity {
    pub fn detect() -> Self {
        let sys = System::new_all();

        let cpus = sys
            .cpus()
            .iter()
            .map(|cpu| CpuDescriptor {
                model: cpu.brand().to_owned(),
                // some machines report slightly different clock speeds on
                // every reboot, quantize to the nearest 100MHz
                mhz: quantize_mhz(cpu.frequency()),
            })
            .collect();

        Self { cpus }
    }

    /// short stable partition key for this host
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.cpus).as_bytes());

        hex::encode(hasher.finalize())[..8].to_owned()
    }
}

fn quantize_mhz(mhz: u64) -> u64 {
    (mhz + 50) / 100 * 100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(model: &str, mhz: u64) -> SystemIdentity {
        SystemIdentity {
            cpus: vec![CpuDescriptor {
                model: model.to_owned(),
                mhz,
            }],
        }
    }

    #[test]
    fn quantizes_to_nearest_100mhz() {
        assert_eq!(quantize_mhz(3392), 3400);
        assert_eq!(quantize_mhz(3349), 3300);
        assert_eq!(quantize_mhz(3350), 3400);
        assert_eq!(quantize_mhz(0), 0);
    }

    #[test]
    fn id_is_stable_and_short() {
        let a = identity("AMD Ryzen 9 5950X", 3400);
        let b = identity("AMD Ryzen 9 5950X", 3400);

        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 8);
    }

    #[test]
    fn id_differs_between_hosts() {
        let a = identity("AMD Ryzen 9 5950X", 3400);
        let b = identity("Intel Core i9-12900K", 3200);

        assert_ne!(a.id(), b.id());
    }
}
