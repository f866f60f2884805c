//! Component-by-component masking and reduction.
//!
//! ```text
//!   ComponentSet ──┬─▶ extract(component i) ──▶ reduce(mask, subjects) ──▶ row i
//!                  │                                    │
//!                  │                      (optional) masks/IC_<group>_<i>
//!                  │                      (optional) masked_data/masked_<group>_<policy>_<i>.txt
//!                  └─▶ ... next component
//! ```

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::loader::{save_matrix_txt, save_volume};
use crate::data::model::{format_shape, ComponentSet, ResultMatrix, SubjectStack, Volume};
use crate::error::{Result, RoiError};
use crate::mask::{self, Mask, MaskPolicy};
use crate::reduce;

pub const MASK_DIR: &str = "masks";
pub const MASKED_DATA_DIR: &str = "masked_data";
pub const MASK_EXTENSION: &str = "nii.gz";

/// Component scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    /// Components in index order on the calling thread.
    #[default]
    Sequential,
    /// Components on the rayon pool; rows and snapshots still land in
    /// index order.
    Parallel,
}

/// What a failing component does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The first failing component aborts the run.
    #[default]
    Abort,
    /// Leave the row as NaN, record the failure and continue.
    SkipRow,
}

/// A component whose row was skipped.
#[derive(Debug)]
pub struct RowFailure {
    pub index: usize,
    pub error: RoiError,
}

/// Output of one pipeline run.
#[derive(Debug)]
pub struct RunOutcome {
    pub matrix: ResultMatrix,
    /// Empty unless running with [`FailureMode::SkipRow`].
    pub failures: Vec<RowFailure>,
    /// NaN cells in `matrix` (empty regions, skipped rows).
    pub nan_cells: usize,
}

// ---------------------------------------------------------------------------
// ReductionPipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReductionPipeline {
    pub policy: MaskPolicy,
    /// Label used in persisted file names.
    pub group: String,
    /// Where masks and running snapshots go. `None` disables all I/O.
    pub output_dir: Option<PathBuf>,
    pub execution: Execution,
    pub on_failure: FailureMode,
}

impl ReductionPipeline {
    pub fn new(policy: MaskPolicy) -> Self {
        ReductionPipeline {
            policy,
            group: String::new(),
            output_dir: None,
            execution: Execution::default(),
            on_failure: FailureMode::default(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.on_failure = mode;
        self
    }

    pub fn mask_path(&self, dir: &Path, index: usize) -> PathBuf {
        dir.join(MASK_DIR)
            .join(format!("IC_{}_{index}.{MASK_EXTENSION}", self.group))
    }

    pub fn snapshot_path(&self, dir: &Path, index: usize) -> PathBuf {
        dir.join(MASKED_DATA_DIR).join(format!(
            "masked_{}_{}_{index}.txt",
            self.group,
            self.policy.name()
        ))
    }

    /// Build the `(components, subjects)` table for `components` × `subjects`.
    pub fn run(&self, components: &ComponentSet, subjects: &SubjectStack) -> Result<RunOutcome> {
        let n_components = components.len();
        let n_subjects = subjects.n_subjects();
        log::info!(
            "reducing {n_components} components over {n_subjects} subjects ({} policy, {:?})",
            self.policy.name(),
            self.execution
        );

        if let Some(dir) = &self.output_dir {
            for sub in [MASK_DIR, MASKED_DATA_DIR] {
                let path = dir.join(sub);
                std::fs::create_dir_all(&path).map_err(|e| RoiError::Persist {
                    path,
                    message: e.to_string(),
                })?;
            }
        }

        let mut outcome = RunOutcome {
            matrix: ResultMatrix::new(n_components, n_subjects),
            failures: Vec::new(),
            nan_cells: 0,
        };

        match self.execution {
            Execution::Sequential => {
                for (index, component) in components.iter().enumerate() {
                    let row = self.process_component(index, component, subjects);
                    self.commit(&mut outcome, index, row)?;
                }
            }
            Execution::Parallel => {
                let rows: Vec<Result<Vec<f64>>> = components
                    .iter()
                    .collect::<Vec<_>>()
                    .into_par_iter()
                    .enumerate()
                    .map(|(index, component)| self.process_component(index, component, subjects))
                    .collect();
                for (index, row) in rows.into_iter().enumerate() {
                    self.commit(&mut outcome, index, row)?;
                }
            }
        }

        outcome.nan_cells = outcome.matrix.nan_count();
        if outcome.nan_cells > 0 {
            log::warn!(
                "{} result cells are NaN (empty regions or skipped rows)",
                outcome.nan_cells
            );
        }
        Ok(outcome)
    }

    /// Mask, reduce and (optionally) persist the mask of one component.
    /// The mask is dropped before returning.
    fn process_component(
        &self,
        index: usize,
        component: &Volume,
        subjects: &SubjectStack,
    ) -> Result<Vec<f64>> {
        let wrap = |e: RoiError| e.in_component(index, self.policy.name());

        if let Some(shape) = component.spatial_shape() {
            if shape != subjects.spatial_shape() {
                return Err(wrap(RoiError::shape(
                    format_shape(&subjects.spatial_shape()),
                    format_shape(&shape),
                )));
            }
        }
        if !component.frame.matches(subjects.frame()) {
            log::warn!(
                "component {index}: affine differs from the subject stack's; voxels are paired by index"
            );
        }

        let mask = mask::extract(component, &self.policy).map_err(wrap)?;
        let row = reduce::reduce(&mask, subjects).map_err(wrap)?;
        log::debug!("component {index}: {} voxels in mask", mask.support());

        if let Some(dir) = &self.output_dir {
            self.persist_mask(dir, index, &mask).map_err(wrap)?;
        }
        Ok(row)
    }

    fn commit(&self, outcome: &mut RunOutcome, index: usize, row: Result<Vec<f64>>) -> Result<()> {
        match row {
            Ok(values) => outcome.matrix.commit_row(index, &values)?,
            Err(error) => match self.on_failure {
                FailureMode::Abort => return Err(error),
                FailureMode::SkipRow => {
                    log::warn!("skipping row {index}: {error}");
                    outcome.failures.push(RowFailure { index, error });
                }
            },
        }

        if let Some(dir) = &self.output_dir {
            let path = self.snapshot_path(dir, index);
            save_matrix_txt(outcome.matrix.rows_through(index), &path).map_err(|e| {
                RoiError::Persist {
                    path,
                    message: format!("{e:#}"),
                }
                .in_component(index, self.policy.name())
            })?;
        }
        Ok(())
    }

    fn persist_mask(&self, dir: &Path, index: usize, mask: &Mask) -> Result<()> {
        let path = self.mask_path(dir, index);
        save_volume(&mask.to_volume(), &path).map_err(|e| RoiError::Persist {
            path,
            message: format!("{e:#}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::SpatialFrame;
    use crate::mask::ThresholdSpec;
    use ndarray::{Array3, Array4, ArrayD, IxDyn};

    fn subjects(n: usize) -> SubjectStack {
        let data = Array4::from_shape_fn((3, 3, 2, n), |(x, y, z, j)| {
            (x + 3 * y + 9 * z) as f64 + 100.0 * j as f64
        });
        SubjectStack::new(data, SpatialFrame::default())
    }

    fn components(k: usize) -> ComponentSet {
        ComponentSet::new(
            (0..k)
                .map(|i| {
                    let data = Array3::from_shape_fn((3, 3, 2), |(x, y, z)| {
                        if (x + y + z) % k == i { 1.0 + i as f64 } else { -0.5 }
                    });
                    Volume::from_3d(data, SpatialFrame::default())
                })
                .collect(),
        )
    }

    fn absolute(t: f64) -> MaskPolicy {
        MaskPolicy::Threshold {
            threshold: ThresholdSpec::Absolute(t),
            two_sided: false,
        }
    }

    #[test]
    fn result_shape_is_components_by_subjects() {
        for (k, n) in [(1, 1), (2, 5), (3, 1), (1, 4)] {
            let out = ReductionPipeline::new(absolute(0.9))
                .run(&components(k), &subjects(n))
                .unwrap();
            assert_eq!(out.matrix.shape(), (k, n));
            assert!(out.failures.is_empty());
        }
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let comps = components(3);
        let subs = subjects(4);
        for policy in [absolute(0.9), MaskPolicy::Weighted] {
            let pipeline = ReductionPipeline::new(policy);
            let a = pipeline.run(&comps, &subs).unwrap().matrix;
            let b = pipeline.run(&comps, &subs).unwrap().matrix;
            let bits = |m: &ResultMatrix| m.values().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&a), bits(&b));
        }
    }

    #[test]
    fn parallel_matches_sequential() {
        let comps = components(4);
        let subs = subjects(3);
        let seq = ReductionPipeline::new(MaskPolicy::Weighted)
            .run(&comps, &subs)
            .unwrap();
        let par = ReductionPipeline::new(MaskPolicy::Weighted)
            .with_execution(Execution::Parallel)
            .run(&comps, &subs)
            .unwrap();
        assert_eq!(seq.matrix, par.matrix);
    }

    #[test]
    fn failure_aborts_with_component_context() {
        // component 1 never exceeds the cutoff
        let comps = ComponentSet::new(vec![
            Volume::from_3d(Array3::from_elem((3, 3, 2), 5.0), SpatialFrame::default()),
            Volume::from_3d(Array3::from_elem((3, 3, 2), 1.0), SpatialFrame::default()),
        ]);
        let err = ReductionPipeline::new(absolute(2.0))
            .run(&comps, &subjects(2))
            .unwrap_err();
        match err {
            RoiError::Component { index, policy, source } => {
                assert_eq!(index, 1);
                assert_eq!(policy, "threshold");
                assert!(matches!(*source, RoiError::InvalidThreshold { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn skip_row_mode_records_failures() {
        let comps = ComponentSet::new(vec![
            Volume::from_3d(Array3::from_elem((3, 3, 2), -1.0), SpatialFrame::default()),
            Volume::from_3d(Array3::from_elem((3, 3, 2), 2.0), SpatialFrame::default()),
        ]);
        let out = ReductionPipeline::new(MaskPolicy::Weighted)
            .with_failure_mode(FailureMode::SkipRow)
            .run(&comps, &subjects(2))
            .unwrap();
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].index, 0);
        assert!(matches!(out.failures[0].error.root(), RoiError::DegenerateMask { .. }));
        assert!(out.matrix.row(0).iter().all(|v| v.is_nan()));
        assert!(out.matrix.is_committed(1));
    }

    #[test]
    fn grid_mismatch_is_reported() {
        let comps = ComponentSet::new(vec![Volume::new(
            ArrayD::from_elem(IxDyn(&[2, 2, 2]), 1.0),
            SpatialFrame::default(),
        )]);
        let err = ReductionPipeline::new(MaskPolicy::Weighted)
            .run(&comps, &subjects(1))
            .unwrap_err();
        assert!(matches!(err.root(), RoiError::ShapeMismatch { .. }));
    }

    #[test]
    fn snapshot_failure_names_the_component() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ReductionPipeline::new(MaskPolicy::Weighted)
            .with_group("PD")
            .with_output_dir(dir.path());
        // a directory where the second snapshot file should go
        std::fs::create_dir_all(pipeline.snapshot_path(dir.path(), 1)).unwrap();

        let err = pipeline.run(&components(2), &subjects(2)).unwrap_err();
        match &err {
            RoiError::Component { index, policy, source } => {
                assert_eq!(*index, 1);
                assert_eq!(*policy, "weighted");
                assert!(matches!(**source, RoiError::Persist { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn frame_mismatch_still_pairs_voxels_by_index() {
        let mut shifted = SpatialFrame::default();
        shifted.affine[3] = 5.0;
        let comps = ComponentSet::new(
            components(2)
                .iter()
                .map(|c| Volume::new(c.data.clone(), shifted))
                .collect(),
        );
        let subs = subjects(3);
        let moved = ReductionPipeline::new(absolute(0.9)).run(&comps, &subs).unwrap();
        let aligned = ReductionPipeline::new(absolute(0.9))
            .run(&components(2), &subs)
            .unwrap();
        assert_eq!(moved.matrix, aligned.matrix);
    }

    #[test]
    fn nan_cells_are_counted_in_the_outcome() {
        let comps = ComponentSet::new(vec![
            Volume::from_3d(Array3::from_elem((3, 3, 2), -1.0), SpatialFrame::default()),
            Volume::from_3d(Array3::from_elem((3, 3, 2), 2.0), SpatialFrame::default()),
        ]);
        let out = ReductionPipeline::new(MaskPolicy::Weighted)
            .with_failure_mode(FailureMode::SkipRow)
            .run(&comps, &subjects(4))
            .unwrap();
        assert_eq!(out.nan_cells, 4);

        let clean = ReductionPipeline::new(MaskPolicy::Weighted)
            .run(&components(2), &subjects(4))
            .unwrap();
        assert_eq!(clean.nan_cells, 0);
    }

    #[test]
    fn persists_masks_and_snapshots_per_component() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ReductionPipeline::new(MaskPolicy::Weighted)
            .with_group("PD")
            .with_output_dir(dir.path());
        let out = pipeline.run(&components(2), &subjects(3)).unwrap();

        for i in 0..2 {
            assert!(dir.path().join(format!("masks/IC_PD_{i}.nii.gz")).is_file());
            let snap = dir.path().join(format!("masked_data/masked_PD_weighted_{i}.txt"));
            let text = std::fs::read_to_string(&snap).unwrap();
            let rows: Vec<Vec<f64>> = text
                .lines()
                .map(|l| l.split_whitespace().map(|t| t.parse().unwrap()).collect())
                .collect();
            assert_eq!(rows.len(), i + 1);
            assert_eq!(rows[i], out.matrix.row(i).to_vec());
        }
    }
}
