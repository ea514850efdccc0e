//! Controller variants and their address maps.
//!
//! A variant fixes everything the core needs to know about one flash
//! firmware family: where the calibration region lives on the bus, how big
//! it is, which zones the boot-time CRC check walks, and which byte ranges
//! must never be touched.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::integrity::{CrcZone, ZoneMap};

/// Calibration window size shared by both supported variants.
pub const CAL_SIZE: usize = 0x8_0000;

/// Bus address of the calibration region: flash base `0x800000` plus the
/// `0x100000` region offset.
pub const CAL_BASE_ADDR: u32 = 0x0090_0000;

/// A closed byte range no external write may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForbiddenRegion {
    pub start: usize,
    pub end: usize,
    pub reason: &'static str,
}

impl ForbiddenRegion {
    pub fn overlaps(&self, offset: usize, len: usize) -> bool {
        offset < self.end && offset + len > self.start
    }
}

/// A blacklisted table: known to hold checksum material for boost control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedMap {
    pub offset: usize,
    pub len: usize,
    pub label: &'static str,
}

impl RejectedMap {
    pub fn overlaps(&self, offset: usize, len: usize) -> bool {
        offset < self.offset + self.len && offset + len > self.offset
    }
}

/// Broad classification of a calibration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapCategory {
    Ignition,
    Wgdc,
    Vmax,
    Rpm,
    Other,
}

impl fmt::Display for MapCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapCategory::Ignition => write!(f, "ignition"),
            MapCategory::Wgdc => write!(f, "wgdc"),
            MapCategory::Vmax => write!(f, "vmax"),
            MapCategory::Rpm => write!(f, "rpm"),
            MapCategory::Other => write!(f, "other"),
        }
    }
}

/// Registry entry for a table known to be safe to edit. Advisory: the core
/// uses it only to classify diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedMap {
    pub offset: usize,
    pub len: usize,
    pub category: MapCategory,
    pub label: &'static str,
}

impl ValidatedMap {
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.offset && offset < self.offset + self.len
    }
}

/// Identified flash firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcuVariant {
    Msd80,
    Msd81,
}

impl fmt::Display for EcuVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcuVariant::Msd80 => write!(f, "msd80"),
            EcuVariant::Msd81 => write!(f, "msd81"),
        }
    }
}

impl std::str::FromStr for EcuVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "msd80" => Ok(EcuVariant::Msd80),
            "msd81" => Ok(EcuVariant::Msd81),
            other => Err(format!("unknown controller variant '{other}'")),
        }
    }
}

/// Everything the core knows about one variant.
#[derive(Debug)]
pub struct VariantSpec {
    pub variant: EcuVariant,
    pub base_addr: u32,
    pub cal_size: usize,
    pub zone_map: ZoneMap,
    pub forbidden: &'static [ForbiddenRegion],
    pub rejected: &'static [RejectedMap],
    pub registry: &'static [ValidatedMap],
    pub erase_routine: u16,
    pub checksum_routine: Option<u16>,
    /// Poll requestRoutineResults after the erase routine instead of
    /// trusting the positive final response alone.
    pub erase_poll_results: bool,
}

impl VariantSpec {
    /// Forbidden region overlapping `offset..offset+len`, if any.
    pub fn forbidden_at(&self, offset: usize, len: usize) -> Option<&ForbiddenRegion> {
        self.forbidden.iter().find(|r| r.overlaps(offset, len))
    }

    /// Rejected map overlapping `offset..offset+len`, if any.
    pub fn rejected_at(&self, offset: usize, len: usize) -> Option<&RejectedMap> {
        self.rejected.iter().find(|r| r.overlaps(offset, len))
    }

    /// Registry entry covering `offset`, if any.
    pub fn registry_entry(&self, offset: usize) -> Option<&ValidatedMap> {
        self.registry.iter().find(|m| m.contains(offset))
    }
}

/// Byte ranges that brick the controller when altered. The flash-counter
/// block sits past the calibration window; it is recorded for completeness.
const FORBIDDEN: &[ForbiddenRegion] = &[
    ForbiddenRegion { start: 0x000000, end: 0x008000, reason: "boot code" },
    ForbiddenRegion { start: 0x054A90, end: 0x054B50, reason: "WGDC checksum block A" },
    ForbiddenRegion { start: 0x05AD20, end: 0x05AD80, reason: "WGDC checksum block B" },
    ForbiddenRegion { start: 0x1F0000, end: 0x200000, reason: "flash counter / config" },
];

const REJECTED: &[RejectedMap] = &[
    RejectedMap { offset: 0x054A90, len: 0xC0, label: "boost checksum block A" },
    RejectedMap { offset: 0x05AD20, len: 0x60, label: "boost checksum block B" },
];

const REGISTRY: &[ValidatedMap] = &[
    ValidatedMap { offset: 0x0093A0, len: 2, category: MapCategory::Vmax, label: "speed limiter" },
    ValidatedMap { offset: 0x0211B8, len: 320, category: MapCategory::Ignition, label: "ignition base" },
    ValidatedMap { offset: 0x05F72A, len: 128, category: MapCategory::Wgdc, label: "WGDC pre-control" },
    ValidatedMap { offset: 0x05F7F6, len: 640, category: MapCategory::Wgdc, label: "WGDC base" },
    ValidatedMap { offset: 0x05FAB2, len: 384, category: MapCategory::Wgdc, label: "WGDC spool" },
];

fn cal_zone_map() -> ZoneMap {
    ZoneMap::new(
        vec![
            CrcZone { name: "cal-a", start: 0x000000, end: 0x0303FC, crc_slot: 0x0303FC },
            CrcZone { name: "cal-b", start: 0x030400, end: 0x0603FC, crc_slot: 0x0603FC },
            CrcZone { name: "cal-c", start: 0x060400, end: 0x07FBFC, crc_slot: 0x07FBFC },
            CrcZone { name: "cal-cfg", start: 0x07FC00, end: 0x07FFFC, crc_slot: 0x07FFFC },
        ],
        CAL_SIZE,
    )
    .expect("calibration zone map invariants hold")
}

impl EcuVariant {
    pub fn spec(self) -> &'static VariantSpec {
        static MSD80: OnceLock<VariantSpec> = OnceLock::new();
        static MSD81: OnceLock<VariantSpec> = OnceLock::new();
        match self {
            EcuVariant::Msd80 => MSD80.get_or_init(|| VariantSpec {
                variant: EcuVariant::Msd80,
                base_addr: CAL_BASE_ADDR,
                cal_size: CAL_SIZE,
                zone_map: cal_zone_map(),
                forbidden: FORBIDDEN,
                rejected: REJECTED,
                registry: REGISTRY,
                erase_routine: crate::uds::ROUTINE_ERASE,
                checksum_routine: Some(crate::uds::ROUTINE_CHECKSUM),
                erase_poll_results: false,
            }),
            EcuVariant::Msd81 => MSD81.get_or_init(|| VariantSpec {
                variant: EcuVariant::Msd81,
                base_addr: CAL_BASE_ADDR,
                cal_size: CAL_SIZE,
                zone_map: cal_zone_map(),
                forbidden: FORBIDDEN,
                rejected: REJECTED,
                registry: REGISTRY,
                erase_routine: crate::uds::ROUTINE_ERASE,
                checksum_routine: Some(crate::uds::ROUTINE_CHECKSUM),
                // MSD81 reports erase completion through routine results.
                erase_poll_results: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_register() {
        let m80 = EcuVariant::Msd80.spec();
        assert_eq!(m80.cal_size, 0x8_0000);
        assert_eq!(m80.base_addr, 0x0090_0000);
        assert_eq!(m80.zone_map.zones().len(), 4);
        assert!(EcuVariant::Msd81.spec().erase_poll_results);
    }

    #[test]
    fn forbidden_lookup() {
        let spec = EcuVariant::Msd80.spec();
        assert_eq!(spec.forbidden_at(0x054A90, 1).unwrap().reason, "WGDC checksum block A");
        assert_eq!(spec.forbidden_at(0x054A8F, 1), None);
        assert!(spec.forbidden_at(0x054A80, 0x20).is_some());
        assert_eq!(spec.forbidden_at(0x010000, 0x100), None);
    }

    #[test]
    fn registry_lookup() {
        let spec = EcuVariant::Msd81.spec();
        let entry = spec.registry_entry(0x05F7F6 + 10).unwrap();
        assert_eq!(entry.category, MapCategory::Wgdc);
        assert!(spec.registry_entry(0x040000).is_none());
    }

    #[test]
    fn variant_parse_and_display() {
        assert_eq!("MSD80".parse::<EcuVariant>().unwrap(), EcuVariant::Msd80);
        assert_eq!(EcuVariant::Msd81.to_string(), "msd81");
        assert!("mss60".parse::<EcuVariant>().is_err());
    }
}
