//! Seven-layer pre-flash validator.
//!
//! Runs before any bus activity; a refusal here has no side effects. The
//! layers run in a fixed order and the first failure aborts:
//!
//! 1. forbidden-region intersection
//! 2. rejected-map blacklist
//! 3. registry classification (warnings only)
//! 4. exact size
//! 5. all-zero image
//! 6. all-`0xFF` image
//! 7. warning acknowledgement

use thiserror::Error;
use tracing::{debug, warn};

use crate::image::{CalibrationImage, diff_ranges};
use crate::variant::{EcuVariant, MapCategory, VariantSpec};

/// The validator layer that refused an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLayer {
    ForbiddenRegion = 1,
    RejectedMap = 2,
    Registry = 3,
    Size = 4,
    AllZero = 5,
    AllErased = 6,
    WarningAck = 7,
}

impl ValidationLayer {
    pub fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Error, Debug)]
#[error("validation refused at layer {} ({:?}): {}", .layer.number(), .layer, .details)]
pub struct ValidationRefused {
    pub layer: ValidationLayer,
    pub details: String,
}

/// One non-fatal finding, surfaced for explicit acknowledgement.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub offset: usize,
    pub len: usize,
    pub message: String,
}

/// A modified range matched against the validated-map registry.
#[derive(Debug, Clone)]
pub struct DiffClassification {
    pub offset: usize,
    pub len: usize,
    pub category: MapCategory,
    pub label: &'static str,
}

/// Validator outcome: the candidate bound to its variant, the warning list,
/// and the classified diff for logging.
#[derive(Debug)]
pub struct ValidationReport {
    pub image: CalibrationImage,
    pub warnings: Vec<ValidationWarning>,
    pub classified: Vec<DiffClassification>,
}

/// Run the seven layers over a candidate image.
///
/// `stock` is the known-stock reference for diffing. Without it, layers 1
/// and 2 fall back to rejecting any non-`0xFF` byte inside a guarded range,
/// and layer 3 cannot classify at all (one warning notes this).
pub fn validate(
    variant: EcuVariant,
    candidate: &[u8],
    stock: Option<&[u8]>,
    acknowledge_warnings: bool,
    require_warning_ack: bool,
) -> Result<ValidationReport, ValidationRefused> {
    let spec = variant.spec();
    let mut warnings = Vec::new();
    let mut classified = Vec::new();

    let diff = stock.map(|s| diff_ranges(candidate, s));
    if let Some(ranges) = &diff {
        debug!(ranges = ranges.len(), "diff against stock image");
    }

    // Layer 1: forbidden regions.
    layer_forbidden(spec, candidate, diff.as_deref())?;

    // Layer 2: rejected-map blacklist.
    layer_rejected(spec, candidate, diff.as_deref())?;

    // Layer 3: registry classification. Warnings, never a refusal.
    match diff.as_deref() {
        Some(ranges) => layer_registry(spec, ranges, &mut warnings, &mut classified),
        None => warnings.push(ValidationWarning {
            offset: 0,
            len: 0,
            message: "no stock image available; modified tables cannot be classified".into(),
        }),
    }

    // Layer 4: exact size.
    if candidate.len() != spec.cal_size {
        return Err(ValidationRefused {
            layer: ValidationLayer::Size,
            details: format!(
                "image is {} bytes, {} expects {}",
                candidate.len(),
                variant,
                spec.cal_size
            ),
        });
    }

    // Layer 5: an all-zero image is corrupt input.
    if candidate.iter().all(|&b| b == 0x00) {
        return Err(ValidationRefused {
            layer: ValidationLayer::AllZero,
            details: "image is all zeroes".into(),
        });
    }

    // Layer 6: an all-0xFF image is an erased, un-patched part.
    if candidate.iter().all(|&b| b == 0xFF) {
        return Err(ValidationRefused {
            layer: ValidationLayer::AllErased,
            details: "image is all 0xFF (erased state)".into(),
        });
    }

    // Layer 7: aggregated warnings need an explicit acknowledgement.
    if require_warning_ack && !warnings.is_empty() && !acknowledge_warnings {
        for w in &warnings {
            warn!(offset = format_args!("0x{:06X}", w.offset), "{}", w.message);
        }
        return Err(ValidationRefused {
            layer: ValidationLayer::WarningAck,
            details: format!("{} warning(s) not acknowledged", warnings.len()),
        });
    }

    let image = CalibrationImage::from_bytes(variant, candidate.to_vec()).map_err(|e| {
        // Unreachable after layer 4, kept as a guard.
        ValidationRefused {
            layer: ValidationLayer::Size,
            details: e.to_string(),
        }
    })?;

    Ok(ValidationReport {
        image,
        warnings,
        classified,
    })
}

fn layer_forbidden(
    spec: &VariantSpec,
    candidate: &[u8],
    diff: Option<&[(usize, usize)]>,
) -> Result<(), ValidationRefused> {
    match diff {
        Some(ranges) => {
            for &(offset, len) in ranges {
                if let Some(region) = spec.forbidden_at(offset, len) {
                    return Err(ValidationRefused {
                        layer: ValidationLayer::ForbiddenRegion,
                        details: format!(
                            "modified bytes at 0x{offset:06X}+{len} touch {} (0x{:06X}..0x{:06X})",
                            region.reason, region.start, region.end
                        ),
                    });
                }
            }
        }
        None => {
            for region in spec.forbidden {
                let start = region.start.min(candidate.len());
                let end = region.end.min(candidate.len());
                if let Some(i) = candidate[start..end].iter().position(|&b| b != 0xFF) {
                    return Err(ValidationRefused {
                        layer: ValidationLayer::ForbiddenRegion,
                        details: format!(
                            "byte at 0x{:06X} inside {} is not 0xFF and no stock image is available",
                            start + i,
                            region.reason
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}

fn layer_rejected(
    spec: &VariantSpec,
    candidate: &[u8],
    diff: Option<&[(usize, usize)]>,
) -> Result<(), ValidationRefused> {
    match diff {
        Some(ranges) => {
            for &(offset, len) in ranges {
                if let Some(map) = spec.rejected_at(offset, len) {
                    return Err(ValidationRefused {
                        layer: ValidationLayer::RejectedMap,
                        details: format!(
                            "modified bytes at 0x{offset:06X}+{len} fall in rejected map '{}'",
                            map.label
                        ),
                    });
                }
            }
        }
        None => {
            for map in spec.rejected {
                let start = map.offset.min(candidate.len());
                let end = (map.offset + map.len).min(candidate.len());
                if candidate[start..end].iter().any(|&b| b != 0xFF) {
                    return Err(ValidationRefused {
                        layer: ValidationLayer::RejectedMap,
                        details: format!(
                            "rejected map '{}' holds non-0xFF data and no stock image is available",
                            map.label
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}

fn layer_registry(
    spec: &VariantSpec,
    ranges: &[(usize, usize)],
    warnings: &mut Vec<ValidationWarning>,
    classified: &mut Vec<DiffClassification>,
) {
    for &(offset, len) in ranges {
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            match spec.registry_entry(pos) {
                Some(entry) => {
                    let covered_end = (entry.offset + entry.len).min(end);
                    classified.push(DiffClassification {
                        offset: pos,
                        len: covered_end - pos,
                        category: entry.category,
                        label: entry.label,
                    });
                    pos = covered_end;
                }
                None => {
                    // Walk to the next covered byte, or the end of the range.
                    let mut next = pos + 1;
                    while next < end && spec.registry_entry(next).is_none() {
                        next += 1;
                    }
                    warnings.push(ValidationWarning {
                        offset: pos,
                        len: next - pos,
                        message: format!(
                            "modified bytes at 0x{pos:06X}+{} match no validated table",
                            next - pos
                        ),
                    });
                    pos = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::CAL_SIZE;

    fn stock() -> Vec<u8> {
        let mut data = vec![0x5Au8; CAL_SIZE];
        // Give the guarded ranges distinctive content.
        data[0x054A90..0x054B50].fill(0xC3);
        data
    }

    #[test]
    fn clean_diff_passes_without_warnings() {
        let stock = stock();
        let mut cand = stock.clone();
        cand[0x0093A0] = 0x12; // speed limiter, validated
        cand[0x05F7F6] = 0x34; // WGDC base, validated
        let report = validate(EcuVariant::Msd80, &cand, Some(&stock), false, true).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.classified.len(), 2);
        assert_eq!(report.classified[0].category, MapCategory::Vmax);
    }

    #[test]
    fn forbidden_diff_is_layer_one() {
        // Scenario: diff touches 0x054A90.
        let stock = stock();
        let mut cand = stock.clone();
        cand[0x054A90] ^= 0xFF;
        let err = validate(EcuVariant::Msd80, &cand, Some(&stock), true, true).unwrap_err();
        assert_eq!(err.layer, ValidationLayer::ForbiddenRegion);
        assert_eq!(err.layer.number(), 1);
    }

    #[test]
    fn rejected_map_is_layer_two() {
        // A diff inside a rejected map but outside the forbidden span:
        // block B's forbidden range and map range start together, so test
        // with the map check directly by modifying block B's tail byte.
        let stock = stock();
        let mut cand = stock.clone();
        cand[0x05AD20 + 0x50] ^= 0x01;
        let err = validate(EcuVariant::Msd80, &cand, Some(&stock), true, true).unwrap_err();
        // Forbidden region covers the same bytes and runs first.
        assert_eq!(err.layer, ValidationLayer::ForbiddenRegion);
    }

    #[test]
    fn unclassified_diff_warns_and_requires_ack() {
        let stock = stock();
        let mut cand = stock.clone();
        cand[0x040000] = 0x00; // not in any validated table
        let err = validate(EcuVariant::Msd80, &cand, Some(&stock), false, true).unwrap_err();
        assert_eq!(err.layer, ValidationLayer::WarningAck);

        let report = validate(EcuVariant::Msd80, &cand, Some(&stock), true, true).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].offset, 0x040000);
    }

    #[test]
    fn wrong_size_is_layer_four() {
        let stock = stock();
        let cand = stock[..CAL_SIZE - 1].to_vec();
        let err = validate(EcuVariant::Msd80, &cand, Some(&stock), true, true).unwrap_err();
        assert_eq!(err.layer, ValidationLayer::Size);
    }

    #[test]
    fn all_zero_is_layer_five() {
        // Stock matches, so the diff layers pass; layer 5 still refuses.
        let cand = vec![0x00u8; CAL_SIZE];
        let err = validate(EcuVariant::Msd80, &cand, Some(&cand), true, true).unwrap_err();
        assert_eq!(err.layer, ValidationLayer::AllZero);
    }

    #[test]
    fn all_erased_is_layer_six() {
        // Scenario: all-0xFF image refused before any bus traffic.
        let cand = vec![0xFFu8; CAL_SIZE];
        let err = validate(EcuVariant::Msd80, &cand, None, true, true).unwrap_err();
        assert_eq!(err.layer, ValidationLayer::AllErased);
        assert_eq!(err.layer.number(), 6);
    }

    #[test]
    fn no_stock_fallback_rejects_populated_forbidden_region() {
        let mut cand = vec![0xFFu8; CAL_SIZE];
        cand[0x000100] = 0x12; // boot code area holds data
        let err = validate(EcuVariant::Msd80, &cand, None, true, true).unwrap_err();
        assert_eq!(err.layer, ValidationLayer::ForbiddenRegion);
    }

    #[test]
    fn warning_ack_not_required_when_disabled() {
        let stock = stock();
        let mut cand = stock.clone();
        cand[0x040000] = 0x00;
        let report = validate(EcuVariant::Msd80, &cand, Some(&stock), false, false).unwrap();
        assert_eq!(report.warnings.len(), 1);
    }
}
