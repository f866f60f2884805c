//! Per-subject reduction of a masked region to one scalar.

use ndarray::Zip;

use crate::data::model::{format_shape, SubjectStack};
use crate::error::{Result, RoiError};
use crate::mask::{Mask, MaskKind};
use crate::stats;

/// Reduce every subject in `subjects` to one value inside `mask`.
///
/// The reducer follows the mask kind: binary masks give the NaN-ignoring
/// mean of in-mask voxels, weighted masks give the weight-normalized sum.
/// Output index `j` is always subject `j`.
pub fn reduce(mask: &Mask, subjects: &SubjectStack) -> Result<Vec<f64>> {
    if mask.spatial_shape() != subjects.spatial_shape() {
        return Err(RoiError::shape(
            format_shape(&subjects.spatial_shape()),
            format_shape(&mask.spatial_shape()),
        ));
    }
    match mask.kind {
        MaskKind::Binary => Ok(mean_in_mask(mask, subjects)),
        MaskKind::Weighted => weighted_sum(mask, subjects),
    }
}

/// Mean of each subject's voxels where the mask is nonzero, ignoring NaN.
/// An empty selection yields NaN for that subject.
fn mean_in_mask(mask: &Mask, subjects: &SubjectStack) -> Vec<f64> {
    subjects
        .subjects()
        .enumerate()
        .map(|(j, subject)| {
            let selected = subject
                .iter()
                .zip(mask.values.iter())
                .filter(|(_, m)| **m != 0.0)
                .map(|(&v, _)| v);
            let mean = stats::nan_mean(selected);
            if mean.is_nan() {
                log::debug!("subject {j}: empty region inside mask");
            }
            mean
        })
        .collect()
}

/// `sum(subject * weights) / sum(weights)`, with the normalizer computed
/// once per mask.
fn weighted_sum(mask: &Mask, subjects: &SubjectStack) -> Result<Vec<f64>> {
    let total = mask.total_weight();
    if total == 0.0 {
        return Err(RoiError::DegenerateMask { total_weight: total });
    }

    Ok(subjects
        .subjects()
        .map(|subject| {
            let mut acc = 0.0;
            Zip::from(&subject)
                .and(&mask.values)
                .for_each(|&v, &w| acc += v * w);
            acc / total
        })
        .collect())
}
