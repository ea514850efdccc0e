//! CRC zone maps.

use thiserror::Error;

/// One CRC-protected byte range and the slot holding its stored CRC.
///
/// `start..end` is the protected range; `crc_slot` is the 4-byte
/// little-endian location of the stored CRC. The slot must lie outside the
/// zone it protects, or refreshing the CRC would invalidate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcZone {
    pub name: &'static str,
    pub start: usize,
    pub end: usize,
    pub crc_slot: usize,
}

impl CrcZone {
    /// True when `offset..offset+len` touches this zone's protected bytes.
    pub fn overlaps(&self, offset: usize, len: usize) -> bool {
        offset < self.end && offset + len > self.start
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ZoneMapError {
    #[error("zone {0} is empty or inverted")]
    EmptyZone(&'static str),

    #[error("zone {0} overlaps zone {1}")]
    Overlap(&'static str, &'static str),

    #[error("zone {0} contains its own CRC slot")]
    SlotInsideZone(&'static str),

    #[error("zone {zone} does not fit a {image_len} byte image")]
    OutOfRange { zone: &'static str, image_len: usize },
}

/// Ordered, non-overlapping zones for one controller variant.
#[derive(Debug, Clone)]
pub struct ZoneMap {
    zones: Vec<CrcZone>,
}

impl ZoneMap {
    /// Build a zone map, enforcing the registration invariants: zones are
    /// kept in address order, may not overlap each other, may not contain
    /// their own CRC slot, and must fit inside `image_len`.
    pub fn new(mut zones: Vec<CrcZone>, image_len: usize) -> Result<Self, ZoneMapError> {
        zones.sort_by_key(|z| z.start);

        for zone in &zones {
            if zone.start >= zone.end {
                return Err(ZoneMapError::EmptyZone(zone.name));
            }
            if zone.end > image_len || zone.crc_slot + 4 > image_len {
                return Err(ZoneMapError::OutOfRange {
                    zone: zone.name,
                    image_len,
                });
            }
            if zone.crc_slot + 4 > zone.start && zone.crc_slot < zone.end {
                return Err(ZoneMapError::SlotInsideZone(zone.name));
            }
        }
        for pair in zones.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(ZoneMapError::Overlap(pair[0].name, pair[1].name));
            }
        }

        Ok(Self { zones })
    }

    pub fn zones(&self) -> &[CrcZone] {
        &self.zones
    }

    /// Zones whose protected bytes intersect `offset..offset+len`.
    pub fn affected_by(&self, offset: usize, len: usize) -> Vec<&CrcZone> {
        self.zones.iter().filter(|z| z.overlaps(offset, len)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(name: &'static str, start: usize, end: usize, crc_slot: usize) -> CrcZone {
        CrcZone {
            name,
            start,
            end,
            crc_slot,
        }
    }

    #[test]
    fn valid_map_accepted() {
        let map = ZoneMap::new(
            vec![
                zone("b", 0x100, 0x1FC, 0x1FC),
                zone("a", 0x000, 0x0FC, 0x0FC),
            ],
            0x200,
        )
        .unwrap();
        // Sorted into address order.
        assert_eq!(map.zones()[0].name, "a");
    }

    #[test]
    fn slot_inside_own_zone_rejected() {
        let err = ZoneMap::new(vec![zone("bad", 0x000, 0x100, 0x80)], 0x200).unwrap_err();
        assert_eq!(err, ZoneMapError::SlotInsideZone("bad"));
    }

    #[test]
    fn overlapping_zones_rejected() {
        let err = ZoneMap::new(
            vec![
                zone("a", 0x000, 0x100, 0x100),
                zone("b", 0x080, 0x180, 0x180),
            ],
            0x200,
        )
        .unwrap_err();
        assert_eq!(err, ZoneMapError::Overlap("a", "b"));
    }

    #[test]
    fn zone_past_image_rejected() {
        let err = ZoneMap::new(vec![zone("a", 0x000, 0x300, 0x300)], 0x200).unwrap_err();
        assert!(matches!(err, ZoneMapError::OutOfRange { zone: "a", .. }));
    }

    #[test]
    fn affected_by_overlap_queries() {
        let map = ZoneMap::new(
            vec![
                zone("a", 0x000, 0x0FC, 0x0FC),
                zone("b", 0x100, 0x1FC, 0x1FC),
            ],
            0x200,
        )
        .unwrap();
        assert_eq!(map.affected_by(0x50, 4).len(), 1);
        assert_eq!(map.affected_by(0xF0, 0x20).len(), 2);
        assert!(map.affected_by(0xFC, 4).is_empty());
    }
}
