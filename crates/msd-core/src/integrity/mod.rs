//! Calibration integrity engine.
//!
//! The controller's boot check walks a set of CRC-protected zones and
//! compares each stored CRC word against a CRC-32 of the zone bytes
//! (polynomial `0x1EDC6F41`, reflected, init and final XOR `0xFFFFFFFF`).
//! Any image mutation must be followed by a refresh of every zone CRC
//! before transmission, or the controller will refuse to boot.

mod zones;

pub use zones::{CrcZone, ZoneMap, ZoneMapError};

use thiserror::Error;

use crate::variant::VariantSpec;

/// Reflected form of the polynomial `0x1EDC6F41`.
const POLY_REFLECTED: u32 = 0x82F6_3B78;

/// CRC-32 over `data` with the controller's parameters: reflected input and
/// output, initial value `0xFFFFFFFF`, final XOR `0xFFFFFFFF`.
pub fn crc32_cal(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY_REFLECTED & mask);
        }
    }
    crc ^ 0xFFFF_FFFF
}

/// One stored CRC that does not match its zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrcMismatch {
    pub zone: &'static str,
    pub computed: u32,
    pub stored: u32,
}

#[derive(Error, Debug)]
pub enum CrcError {
    #[error("zone {zone} extends past the image (end 0x{end:06X}, image 0x{image_len:06X})")]
    ZoneOutOfBounds {
        zone: &'static str,
        end: usize,
        image_len: usize,
    },

    #[error("{0} CRC zone(s) do not match their stored values")]
    Mismatch(usize),
}

/// CRC of one zone's protected bytes. Depends only on bytes inside the zone.
pub fn compute_zone_crc(image: &[u8], zone: &CrcZone) -> Result<u32, CrcError> {
    if zone.end > image.len() || zone.crc_slot + 4 > image.len() {
        return Err(CrcError::ZoneOutOfBounds {
            zone: zone.name,
            end: zone.end.max(zone.crc_slot + 4),
            image_len: image.len(),
        });
    }
    Ok(crc32_cal(&image[zone.start..zone.end]))
}

/// Recompute every zone CRC and write it back little-endian. Idempotent:
/// slots live outside their zones, so writing them never changes any zone's
/// CRC input.
pub fn refresh_all_crcs(image: &mut [u8], variant: &VariantSpec) -> Result<(), CrcError> {
    for zone in variant.zone_map.zones() {
        let crc = compute_zone_crc(image, zone)?;
        image[zone.crc_slot..zone.crc_slot + 4].copy_from_slice(&crc.to_le_bytes());
        tracing::debug!(zone = zone.name, crc = format_args!("0x{crc:08X}"), "zone CRC written");
    }
    Ok(())
}

/// Check every zone CRC against its stored value.
pub fn verify_all_crcs(image: &[u8], variant: &VariantSpec) -> Result<(), Vec<CrcMismatch>> {
    let mut mismatches = Vec::new();
    for zone in variant.zone_map.zones() {
        let computed = match compute_zone_crc(image, zone) {
            Ok(crc) => crc,
            Err(_) => {
                mismatches.push(CrcMismatch {
                    zone: zone.name,
                    computed: 0,
                    stored: 0,
                });
                continue;
            }
        };
        let stored = u32::from_le_bytes([
            image[zone.crc_slot],
            image[zone.crc_slot + 1],
            image[zone.crc_slot + 2],
            image[zone.crc_slot + 3],
        ]);
        if computed != stored {
            mismatches.push(CrcMismatch {
                zone: zone.name,
                computed,
                stored,
            });
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::EcuVariant;

    #[test]
    fn crc_check_value() {
        // The standard check value for this polynomial.
        assert_eq!(crc32_cal(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn refresh_then_verify_is_ok() {
        let variant = EcuVariant::Msd80.spec();
        let mut image = vec![0x5Au8; variant.cal_size];
        refresh_all_crcs(&mut image, variant).unwrap();
        assert!(verify_all_crcs(&image, variant).is_ok());
    }

    #[test]
    fn refresh_is_idempotent() {
        let variant = EcuVariant::Msd81.spec();
        let mut image = vec![0x33u8; variant.cal_size];
        refresh_all_crcs(&mut image, variant).unwrap();
        let first = image.clone();
        refresh_all_crcs(&mut image, variant).unwrap();
        assert_eq!(image, first);
    }

    #[test]
    fn zone_crc_depends_only_on_zone_bytes() {
        let variant = EcuVariant::Msd80.spec();
        let zone = &variant.zone_map.zones()[0];
        let mut image = vec![0x00u8; variant.cal_size];
        let before = compute_zone_crc(&image, zone).unwrap();

        // Mutate a byte outside the zone (the byte right after its slot).
        image[zone.crc_slot + 4] ^= 0xFF;
        assert_eq!(compute_zone_crc(&image, zone).unwrap(), before);

        // Mutate a byte inside the zone.
        image[zone.start] ^= 0xFF;
        assert_ne!(compute_zone_crc(&image, zone).unwrap(), before);
    }

    #[test]
    fn mutation_without_refresh_is_caught() {
        let variant = EcuVariant::Msd80.spec();
        let mut image = vec![0x5Au8; variant.cal_size];
        refresh_all_crcs(&mut image, variant).unwrap();

        image[0x100] ^= 0x01;
        let mismatches = verify_all_crcs(&image, variant).unwrap_err();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].zone, variant.zone_map.zones()[0].name);
    }

    #[test]
    fn short_image_is_out_of_bounds() {
        let variant = EcuVariant::Msd80.spec();
        let image = vec![0u8; 0x1000];
        let zone = &variant.zone_map.zones()[0];
        assert!(matches!(
            compute_zone_crc(&image, zone),
            Err(CrcError::ZoneOutOfBounds { .. })
        ));
    }
}
