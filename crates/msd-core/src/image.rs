//! Candidate calibration images.

use thiserror::Error;

use crate::variant::{EcuVariant, VariantSpec};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image is {actual} bytes, {variant} expects {expected}")]
    WrongSize {
        variant: EcuVariant,
        actual: usize,
        expected: usize,
    },
}

/// A contiguous calibration image bound to its variant.
///
/// Read-only once constructed; the orchestrator's CRC-refresh step is the
/// only mutation point and runs under an exclusive borrow.
#[derive(Debug, Clone)]
pub struct CalibrationImage {
    variant: EcuVariant,
    data: Vec<u8>,
}

impl CalibrationImage {
    pub fn from_bytes(variant: EcuVariant, data: Vec<u8>) -> Result<Self, ImageError> {
        let expected = variant.spec().cal_size;
        if data.len() != expected {
            return Err(ImageError::WrongSize {
                variant,
                actual: data.len(),
                expected,
            });
        }
        Ok(Self { variant, data })
    }

    pub fn variant(&self) -> EcuVariant {
        self.variant
    }

    pub fn spec(&self) -> &'static VariantSpec {
        self.variant.spec()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Contiguous byte ranges where `candidate` differs from `stock`. Length
/// differences count as one modified tail range.
pub fn diff_ranges(candidate: &[u8], stock: &[u8]) -> Vec<(usize, usize)> {
    let common = candidate.len().min(stock.len());
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut run_start: Option<usize> = None;

    for i in 0..common {
        if candidate[i] != stock[i] {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            ranges.push((start, i - start));
        }
    }
    if let Some(start) = run_start {
        ranges.push((start, common - start));
    }
    if candidate.len() > common {
        ranges.push((common, candidate.len() - common));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_enforced() {
        let err = CalibrationImage::from_bytes(EcuVariant::Msd80, vec![0u8; 16]).unwrap_err();
        assert!(matches!(err, ImageError::WrongSize { expected: 0x8_0000, .. }));

        let image =
            CalibrationImage::from_bytes(EcuVariant::Msd80, vec![0u8; 0x8_0000]).unwrap();
        assert_eq!(image.len(), 0x8_0000);
    }

    #[test]
    fn diff_merges_runs() {
        let stock = vec![0u8; 32];
        let mut cand = stock.clone();
        cand[4] = 1;
        cand[5] = 2;
        cand[10] = 3;
        assert_eq!(diff_ranges(&cand, &stock), vec![(4, 2), (10, 1)]);
    }

    #[test]
    fn diff_counts_length_tail() {
        let stock = vec![0u8; 8];
        let cand = vec![0u8; 12];
        assert_eq!(diff_ranges(&cand, &stock), vec![(8, 4)]);
    }

    #[test]
    fn identical_images_have_no_diff() {
        let data = vec![7u8; 64];
        assert!(diff_ranges(&data, &data).is_empty());
    }
}
