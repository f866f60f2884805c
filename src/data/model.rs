use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayView1, ArrayView2, ArrayView3, Axis, Ix3, Ix4};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoiError};

// ---------------------------------------------------------------------------
// SpatialFrame – orientation metadata carried through untouched
// ---------------------------------------------------------------------------

/// Voxel-to-world affine (4x4, row-major). Never interpreted numerically by
/// the pipeline; copied onto every derived volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialFrame {
    pub affine: [f64; 16],
}

impl Default for SpatialFrame {
    fn default() -> Self {
        #[rustfmt::skip]
        let affine = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        SpatialFrame { affine }
    }
}

impl SpatialFrame {
    /// Affines agree to within `1e-6` in every entry.
    pub fn matches(&self, other: &SpatialFrame) -> bool {
        self.affine
            .iter()
            .zip(other.affine.iter())
            .all(|(a, b)| (a - b).abs() <= 1e-6)
    }
}

// ---------------------------------------------------------------------------
// Volume – a 3D or 4D array of intensities
// ---------------------------------------------------------------------------

/// A loaded image: intensities indexed `[x, y, z(, t)]` plus its frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: ArrayD<f64>,
    pub frame: SpatialFrame,
}

impl Volume {
    pub fn new(data: ArrayD<f64>, frame: SpatialFrame) -> Self {
        Volume { data, frame }
    }

    pub fn from_3d(data: Array3<f64>, frame: SpatialFrame) -> Self {
        Volume::new(data.into_dyn(), frame)
    }

    pub fn from_4d(data: Array4<f64>, frame: SpatialFrame) -> Self {
        Volume::new(data.into_dyn(), frame)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// First three axes, if the volume has at least three.
    pub fn spatial_shape(&self) -> Option<[usize; 3]> {
        let sh = self.shape();
        (sh.len() >= 3).then(|| [sh[0], sh[1], sh[2]])
    }

    /// View as 3D. A 4D volume with a single trailing image is accepted.
    pub fn view_3d(&self) -> Result<ArrayView3<'_, f64>> {
        let view = match self.ndim() {
            3 => self.data.view(),
            4 if self.shape()[3] == 1 => self.data.index_axis(Axis(3), 0),
            _ => return Err(RoiError::shape("a 3D volume", format_shape(self.shape()))),
        };
        view.into_dimensionality::<Ix3>()
            .map_err(|e| RoiError::shape("a 3D volume", e.to_string()))
    }

    /// Split along the trailing axis into 3D volumes sharing this frame.
    pub fn iter_images(&self) -> impl Iterator<Item = Volume> + '_ {
        let frame = self.frame;
        let owned: Vec<ArrayD<f64>> = if self.ndim() == 4 {
            self.data
                .axis_iter(Axis(3))
                .map(|img| img.to_owned())
                .collect()
        } else {
            vec![self.data.clone()]
        };
        owned.into_iter().map(move |data| Volume::new(data, frame))
    }
}

/// Render a shape as `(a, b, c)`.
pub fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("({})", dims.join(", "))
}

// ---------------------------------------------------------------------------
// ComponentSet – ordered spatial components
// ---------------------------------------------------------------------------

/// The K spatial components returned by a decomposition, in decomposer order.
#[derive(Debug, Clone)]
pub struct ComponentSet {
    components: Vec<Volume>,
}

impl ComponentSet {
    pub fn new(components: Vec<Volume>) -> Self {
        ComponentSet { components }
    }

    /// Split a 4D volume (component axis last) into its components.
    pub fn from_volume(volume: &Volume) -> Self {
        ComponentSet::new(volume.iter_images().collect())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Volume> {
        self.components.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Volume> {
        self.components.iter()
    }

    /// Stack back into a single 4D volume, component axis last.
    pub fn to_volume(&self) -> Result<Volume> {
        let first = self
            .components
            .first()
            .ok_or_else(|| RoiError::shape("at least one component", "none"))?;
        let views = self
            .components
            .iter()
            .map(|c| c.view_3d())
            .collect::<Result<Vec<_>>>()?;
        let stacked = ndarray::stack(Axis(3), &views)
            .map_err(|e| RoiError::shape("components on one grid", e.to_string()))?;
        Ok(Volume::from_4d(stacked, first.frame))
    }
}

// ---------------------------------------------------------------------------
// SubjectStack – per-subject maps, subject axis last
// ---------------------------------------------------------------------------

/// A 4D stack of subject maps indexed `[x, y, z, subject]`.
#[derive(Debug, Clone)]
pub struct SubjectStack {
    data: Array4<f64>,
    frame: SpatialFrame,
}

impl SubjectStack {
    pub fn new(data: Array4<f64>, frame: SpatialFrame) -> Self {
        SubjectStack { data, frame }
    }

    /// Accept a 4D volume, or a 3D volume as a single-subject stack.
    pub fn from_volume(volume: Volume) -> Result<Self> {
        let frame = volume.frame;
        let data = match volume.ndim() {
            3 => volume.data.insert_axis(Axis(3)),
            4 => volume.data,
            _ => {
                return Err(RoiError::shape(
                    "a 3D or 4D subject stack",
                    format_shape(volume.shape()),
                ))
            }
        };
        let data = data
            .into_dimensionality::<Ix4>()
            .map_err(|e| RoiError::shape("a 4D subject stack", e.to_string()))?;
        Ok(SubjectStack::new(data, frame))
    }

    pub fn n_subjects(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        let (x, y, z, _) = self.data.dim();
        [x, y, z]
    }

    pub fn frame(&self) -> &SpatialFrame {
        &self.frame
    }

    /// The 3D map of subject `j`.
    pub fn subject(&self, j: usize) -> ArrayView3<'_, f64> {
        self.data.index_axis(Axis(3), j)
    }

    pub fn subjects(&self) -> impl Iterator<Item = ArrayView3<'_, f64>> + '_ {
        self.data.axis_iter(Axis(3))
    }
}

// ---------------------------------------------------------------------------
// ResultMatrix – component × subject scalar table
// ---------------------------------------------------------------------------

/// Dense `(components, subjects)` table of regional summaries.
///
/// Rows start as NaN and are committed once each; a committed row is never
/// overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMatrix {
    values: Array2<f64>,
    committed: Vec<bool>,
}

impl ResultMatrix {
    pub fn new(n_components: usize, n_subjects: usize) -> Self {
        ResultMatrix {
            values: Array2::from_elem((n_components, n_subjects), f64::NAN),
            committed: vec![false; n_components],
        }
    }

    /// `(n_components, n_subjects)`.
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn commit_row(&mut self, index: usize, row: &[f64]) -> Result<()> {
        let (n_rows, n_cols) = self.shape();
        if index >= n_rows {
            return Err(RoiError::shape(
                format!("row index < {n_rows}"),
                index.to_string(),
            ));
        }
        if row.len() != n_cols {
            return Err(RoiError::shape(
                format!("{n_cols} subject values"),
                row.len().to_string(),
            ));
        }
        if self.committed[index] {
            return Err(RoiError::RowCommitted(index));
        }
        self.values
            .row_mut(index)
            .iter_mut()
            .zip(row)
            .for_each(|(dst, &v)| *dst = v);
        self.committed[index] = true;
        Ok(())
    }

    pub fn is_committed(&self, index: usize) -> bool {
        self.committed.get(index).copied().unwrap_or(false)
    }

    pub fn get(&self, component: usize, subject: usize) -> Option<f64> {
        self.values.get((component, subject)).copied()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Rows `0..=last`, the snapshot persisted after component `last`.
    pub fn rows_through(&self, last: usize) -> ArrayView2<'_, f64> {
        let end = (last + 1).min(self.values.nrows());
        self.values.slice(s![..end, ..])
    }

    /// Number of NaN cells (empty regions, skipped rows).
    pub fn nan_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }
}
