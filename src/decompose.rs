//! Spatial independent component analysis of a cohort of aligned maps.
//!
//! The pipeline only relies on the [`ComponentDecomposer`] contract; [`FastIca`]
//! is the bundled implementation, a thin adapter over `linfa-ica` that treats
//! voxels as samples and images as features.

use std::path::{Path, PathBuf};

use anyhow::Context;
use linfa::dataset::DatasetBase;
use linfa::traits::{Fit, Predict};
use linfa_ica::fast_ica::{self, GFunc};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::data::loader::save_volume;
use crate::data::model::{format_shape, ComponentSet, Volume};
use crate::error::{Result, RoiError};

/// Produces `n_components` spatial maps from aligned input volumes.
///
/// Implementations must return exactly `n_components` volumes on the input
/// grid, in an order that is stable for a fixed seed and input order.
pub trait ComponentDecomposer {
    fn decompose(&self, images: &[Volume], n_components: usize) -> Result<ComponentSet>;
}

// ---------------------------------------------------------------------------
// FastIca
// ---------------------------------------------------------------------------

/// FastICA settings (logcosh contrast).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastIca {
    pub seed: u64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for FastIca {
    fn default() -> Self {
        FastIca {
            seed: 0,
            max_iterations: 200,
            tolerance: 1e-4,
        }
    }
}

impl FastIca {
    pub fn with_seed(seed: u64) -> Self {
        FastIca {
            seed,
            ..FastIca::default()
        }
    }
}

impl ComponentDecomposer for FastIca {
    fn decompose(&self, images: &[Volume], n_components: usize) -> Result<ComponentSet> {
        let maps: Vec<Volume> = images.iter().flat_map(|v| v.iter_images()).collect();
        let first = maps
            .first()
            .ok_or_else(|| RoiError::Decomposition("no input images".to_string()))?;
        let frame = first.frame;
        let grid = first.view_3d()?.dim();

        if n_components == 0 || n_components > maps.len() {
            return Err(RoiError::Decomposition(format!(
                "cannot extract {n_components} components from {} images",
                maps.len()
            )));
        }

        let mut flat: Vec<Vec<f64>> = Vec::with_capacity(maps.len());
        for map in &maps {
            let view = map.view_3d()?;
            if view.dim() != grid {
                return Err(RoiError::shape(
                    format_shape(&[grid.0, grid.1, grid.2]),
                    format_shape(view.shape()),
                ));
            }
            flat.push(view.iter().copied().collect());
        }

        // Voxels finite everywhere and nonzero somewhere.
        let n_voxels = grid.0 * grid.1 * grid.2;
        let support: Vec<usize> = (0..n_voxels)
            .filter(|&i| {
                flat.iter().all(|img| img[i].is_finite()) && flat.iter().any(|img| img[i] != 0.0)
            })
            .collect();
        if support.len() <= n_components {
            return Err(RoiError::Decomposition(format!(
                "{} usable voxels are too few for {n_components} components",
                support.len()
            )));
        }
        log::info!(
            "FastICA: {} images, {} voxels in support, {n_components} components",
            maps.len(),
            support.len()
        );

        // (voxels, images)
        let x = Array2::from_shape_fn((support.len(), flat.len()), |(r, c)| flat[c][support[r]]);
        drop(flat);

        let model = fast_ica::FastIca::<f64>::params()
            .ncomponents(n_components)
            .gfunc(GFunc::Logcosh(1.0))
            .max_iter(self.max_iterations)
            .tol(self.tolerance)
            .random_state(self.seed as usize)
            .fit(&DatasetBase::from(x.view()))
            .map_err(|e| RoiError::Decomposition(e.to_string()))?;
        let mut sources = model.predict(&x);

        for mut source in sources.axis_iter_mut(Axis(1)) {
            let max = source.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let min = source.fold(f64::INFINITY, |a, &b| a.min(b));
            if max < -min {
                source.mapv_inplace(|v| -v);
            }
        }

        let components = sources
            .axis_iter(Axis(1))
            .map(|source| {
                let mut dense = vec![0.0; n_voxels];
                for (&voxel, &v) in support.iter().zip(source.iter()) {
                    dense[voxel] = v;
                }
                Array3::from_shape_vec(grid, dense)
                    .map(|data| Volume::from_3d(data, frame))
                    .map_err(|e| RoiError::Decomposition(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ComponentSet::new(components))
    }
}

/// Decompose and write the components as one 4D image
/// `ICAs_<group>_<iteration>.nii.gz` in `dir`.
pub fn decompose_and_save(
    decomposer: &dyn ComponentDecomposer,
    images: &[Volume],
    n_components: usize,
    dir: &Path,
    group: &str,
    iteration: &str,
) -> anyhow::Result<(ComponentSet, PathBuf)> {
    let components = decomposer.decompose(images, n_components)?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("ICAs_{group}_{iteration}.nii.gz"));
    save_volume(&components.to_volume()?, &path)?;
    log::info!("wrote {} components to {}", components.len(), path.display());
    Ok((components, path))
}
