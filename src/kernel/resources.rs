//! Kernel resource grant and its `resource.txt` encoding.
//!
//! The grant is written once by the provisioning step and read back during
//! recovery, so the text form must stay stable:
//!
//! ```text
//! VERSION=1
//! CID=<container id>
//! SCRATCH_SIZE=<bytes>
//! MOUNTS=<m1>,<m2>,...
//! SLOTS={"cpu":"2","mem":"4294967296"}
//! SHMEM=<bytes>                      (optional)
//! <SLOT_NAME_UPPER>_SHARES=<dev>:<amount>,...
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Error, Result};

/// Current `resource.txt` format version.
pub const RESOURCE_SPEC_VERSION: u32 = 1;

/// Per-device share amounts for one slot: device id -> amount (decimal text).
pub type DeviceShares = BTreeMap<String, String>;

/// Allocated resource slots and backend-specific options.
///
/// Immutable for the kernel's lifetime; a new kernel is created to change
/// the allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelResourceSpec {
    /// Container id as seen from inside the container.
    pub container_id: String,

    /// Originally requested slots (slot name -> amount).
    pub slots: BTreeMap<String, String>,

    /// device name -> slot name -> device id -> amount
    pub allocations: BTreeMap<String, BTreeMap<String, DeviceShares>>,

    /// Scratch disk size in bytes.
    pub scratch_disk_size: u64,

    /// Mounted volume descriptors.
    pub mounts: Vec<String>,

    /// Shared memory size in bytes.
    pub shared_memory: Option<u64>,
}

impl KernelResourceSpec {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            slots: BTreeMap::new(),
            allocations: BTreeMap::new(),
            scratch_disk_size: 0,
            mounts: Vec::new(),
            shared_memory: None,
        }
    }

    /// Encode to the `resource.txt` text form.
    pub fn write_to_string(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str(&format!("VERSION={}\n", RESOURCE_SPEC_VERSION));
        out.push_str(&format!("CID={}\n", self.container_id));
        out.push_str(&format!("SCRATCH_SIZE={}\n", self.scratch_disk_size));

        for mount in &self.mounts {
            if mount.contains(',') || mount.contains('\n') {
                return Err(Error::validation(format!("mount descriptor cannot contain ',': {}", mount)));
            }
        }
        out.push_str(&format!("MOUNTS={}\n", self.mounts.join(",")));
        out.push_str(&format!("SLOTS={}\n", serde_json::to_string(&self.slots)?));
        if let Some(shmem) = self.shared_memory {
            out.push_str(&format!("SHMEM={}\n", shmem));
        }

        for (device_name, slots) in &self.allocations {
            for (slot_name, shares) in slots {
                let prefixed = slot_name == device_name
                    || slot_name.starts_with(&format!("{}.", device_name));
                if !prefixed {
                    return Err(Error::validation(format!(
                        "device_name ({}) must be a prefix of slot_name ({})",
                        device_name, slot_name
                    )));
                }
                let pieces: Vec<String> = shares
                    .iter()
                    .map(|(dev_id, amount)| format!("{}:{}", dev_id, amount))
                    .collect();
                out.push_str(&format!(
                    "{}_SHARES={}\n",
                    slot_name.to_uppercase(),
                    pieces.join(",")
                ));
            }
        }
        Ok(out)
    }

    /// Decode the `resource.txt` text form.
    ///
    /// Blank lines and unrecognized keys are ignored; `CID` defaults to
    /// `unknown`; `SCRATCH_SIZE`, `MOUNTS` and `SLOTS` are required.
    pub fn read_from_string(text: &str) -> Result<Self> {
        let mut kvpairs: BTreeMap<&str, &str> = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some((key, value)) = line.split_once('=') {
                kvpairs.insert(key, value);
            }
        }

        if let Some(version) = kvpairs.get("VERSION") {
            let version: u32 = version
                .parse()
                .map_err(|_| Error::validation(format!("invalid resource spec version: {}", version)))?;
            if version > RESOURCE_SPEC_VERSION {
                return Err(Error::validation(format!(
                    "unsupported resource spec version {} (max {})",
                    version, RESOURCE_SPEC_VERSION
                )));
            }
        }

        let required = |key: &str| {
            kvpairs
                .get(key)
                .copied()
                .ok_or_else(|| Error::validation(format!("resource spec is missing {}", key)))
        };

        let scratch_disk_size = required("SCRATCH_SIZE")?
            .parse::<u64>()
            .map_err(|e| Error::validation(format!("invalid SCRATCH_SIZE: {}", e)))?;
        let mounts = required("MOUNTS")?
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        let slots: BTreeMap<String, String> = serde_json::from_str(required("SLOTS")?)?;
        let shared_memory = match kvpairs.get("SHMEM") {
            Some(v) => Some(
                v.parse::<u64>()
                    .map_err(|e| Error::validation(format!("invalid SHMEM: {}", e)))?,
            ),
            None => None,
        };

        let mut allocations: BTreeMap<String, BTreeMap<String, DeviceShares>> = BTreeMap::new();
        for (key, value) in &kvpairs {
            let Some(raw_slot) = key.strip_suffix("_SHARES") else {
                continue;
            };
            let slot_name = raw_slot.to_lowercase();
            let device_name = slot_name
                .split('.')
                .next()
                .unwrap_or(slot_name.as_str())
                .to_string();
            let mut shares = DeviceShares::new();
            for entry in value.split(',') {
                let (dev_id, amount) = entry.split_once(':').unwrap_or((entry, ""));
                if dev_id.is_empty() || amount.is_empty() {
                    continue;
                }
                shares.insert(dev_id.to_string(), amount.to_string());
            }
            allocations
                .entry(device_name)
                .or_default()
                .insert(slot_name, shares);
        }

        Ok(Self {
            container_id: kvpairs.get("CID").copied().unwrap_or("unknown").to_string(),
            slots,
            allocations,
            scratch_disk_size,
            mounts,
            shared_memory,
        })
    }
}

impl fmt::Display for KernelResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.write_to_string() {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_spec() -> KernelResourceSpec {
        let mut spec = KernelResourceSpec::new("c0ffee");
        spec.slots.insert("cpu".to_string(), "2".to_string());
        spec.slots.insert("cuda.shares".to_string(), "0.5".to_string());
        spec.scratch_disk_size = 1 << 30;
        spec.mounts = vec!["bind:/data/vfroot/u1:/home/work/u1:rw".to_string()];
        spec.shared_memory = Some(64 * 1024 * 1024);
        let mut cpu = DeviceShares::new();
        cpu.insert("0".to_string(), "1".to_string());
        cpu.insert("1".to_string(), "1".to_string());
        spec.allocations
            .entry("cpu".to_string())
            .or_default()
            .insert("cpu".to_string(), cpu);
        let mut cuda = DeviceShares::new();
        cuda.insert("gpu0".to_string(), "0.5".to_string());
        spec.allocations
            .entry("cuda".to_string())
            .or_default()
            .insert("cuda.shares".to_string(), cuda);
        spec
    }

    #[test]
    fn test_text_form_layout() {
        let text = sample_spec().write_to_string().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "VERSION=1");
        assert_eq!(lines[1], "CID=c0ffee");
        assert!(lines.contains(&"CPU_SHARES=0:1,1:1"));
        assert!(lines.contains(&"CUDA.SHARES_SHARES=gpu0:0.5"));
        assert!(lines.contains(&"SHMEM=67108864"));
    }

    #[test]
    fn test_read_back_preserves_spec() {
        let spec = sample_spec();
        let parsed = KernelResourceSpec::read_from_string(&spec.write_to_string().unwrap()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_slot_must_be_prefixed_by_device() {
        let mut spec = KernelResourceSpec::new("c1");
        spec.allocations
            .entry("cuda".to_string())
            .or_default()
            .insert("mem".to_string(), DeviceShares::new());
        assert!(matches!(spec.write_to_string(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_read_tolerates_blank_lines_and_unknown_keys() {
        let text = "\nSCRATCH_SIZE=0\n\nMOUNTS=\nSLOTS={}\nFUTURE_KEY=1\nCPU_SHARES=0:1,broken,:2\n";
        let spec = KernelResourceSpec::read_from_string(text).unwrap();
        assert_eq!(spec.container_id, "unknown");
        assert!(spec.mounts.is_empty());
        assert_eq!(spec.allocations["cpu"]["cpu"].len(), 1);
    }

    #[test]
    fn test_read_requires_core_keys() {
        assert!(KernelResourceSpec::read_from_string("CID=x\nMOUNTS=\nSLOTS={}\n").is_err());
        assert!(KernelResourceSpec::read_from_string("VERSION=9\nSCRATCH_SIZE=0\nMOUNTS=\nSLOTS={}\n").is_err());
    }

    #[test]
    fn test_mount_with_comma_rejected() {
        let mut spec = KernelResourceSpec::new("c2");
        spec.mounts.push("a,b".to_string());
        assert!(spec.write_to_string().is_err());
    }
}
