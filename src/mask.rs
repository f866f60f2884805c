//! Mask extraction from a single spatial component.
//!
//! ```text
//!   component (3D)
//!        │
//!        ├── Threshold ──▶ binary mask   {0, 1}
//!        │
//!        └── Weighted  ──▶ weighted mask (negatives clipped to 0)
//! ```

use std::fmt;
use std::str::FromStr;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::data::model::{SpatialFrame, Volume};
use crate::error::{Result, RoiError};
use crate::stats;

// ---------------------------------------------------------------------------
// ThresholdSpec – "99.6%" or an absolute cutoff
// ---------------------------------------------------------------------------

/// Cutoff used by the threshold policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThreshold", into = "RawThreshold")]
pub enum ThresholdSpec {
    /// Percentile (0–100) of the component's own voxel distribution.
    Percentile(f64),
    /// Fixed intensity cutoff.
    Absolute(f64),
}

impl Default for ThresholdSpec {
    fn default() -> Self {
        ThresholdSpec::Percentile(99.6)
    }
}

impl FromStr for ThresholdSpec {
    type Err = RoiError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || RoiError::InvalidThreshold {
            reason: format!("cannot parse '{s}' as a threshold"),
        };
        let spec = match s.strip_suffix('%') {
            Some(pct) => ThresholdSpec::Percentile(pct.trim().parse().map_err(|_| invalid())?),
            None => ThresholdSpec::Absolute(s.parse().map_err(|_| invalid())?),
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdSpec::Percentile(p) => write!(f, "{p}%"),
            ThresholdSpec::Absolute(v) => write!(f, "{v}"),
        }
    }
}

impl ThresholdSpec {
    pub fn validate(&self) -> Result<()> {
        match *self {
            ThresholdSpec::Percentile(p) if !(0.0..=100.0).contains(&p) => {
                Err(RoiError::InvalidThreshold {
                    reason: format!("percentile {p} is outside 0..=100"),
                })
            }
            ThresholdSpec::Absolute(v) if !v.is_finite() => Err(RoiError::InvalidThreshold {
                reason: format!("absolute threshold {v} is not finite"),
            }),
            _ => Ok(()),
        }
    }

    /// Resolve to an intensity cutoff for `data`.
    ///
    /// Two-sided percentiles are taken over absolute values.
    pub fn resolve(&self, data: &Array3<f64>, two_sided: bool) -> Result<f64> {
        self.validate()?;
        match *self {
            ThresholdSpec::Absolute(v) => Ok(if two_sided { v.abs() } else { v }),
            ThresholdSpec::Percentile(p) => {
                let values = data.iter().map(|&v| if two_sided { v.abs() } else { v });
                stats::percentile(values, p).ok_or_else(|| RoiError::InvalidThreshold {
                    reason: "component has no finite voxels".to_string(),
                })
            }
        }
    }
}

/// Wire form: `"99.6%"` or a bare number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Number(f64),
    Text(String),
}

impl TryFrom<RawThreshold> for ThresholdSpec {
    type Error = RoiError;

    fn try_from(raw: RawThreshold) -> Result<Self> {
        match raw {
            RawThreshold::Number(v) => {
                let spec = ThresholdSpec::Absolute(v);
                spec.validate()?;
                Ok(spec)
            }
            RawThreshold::Text(s) => s.parse(),
        }
    }
}

impl From<ThresholdSpec> for RawThreshold {
    fn from(spec: ThresholdSpec) -> Self {
        match spec {
            ThresholdSpec::Absolute(v) => RawThreshold::Number(v),
            pct @ ThresholdSpec::Percentile(_) => RawThreshold::Text(pct.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// MaskPolicy – selected once per run
// ---------------------------------------------------------------------------

/// How a component becomes a mask. The reducer is implied by the policy:
/// threshold masks are averaged, weighted masks are weight-normalized sums.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskPolicy {
    Threshold {
        #[serde(default)]
        threshold: ThresholdSpec,
        /// Keep `|v| >= t` instead of `v >= t`.
        #[serde(default)]
        two_sided: bool,
    },
    Weighted,
}

impl Default for MaskPolicy {
    fn default() -> Self {
        MaskPolicy::Threshold {
            threshold: ThresholdSpec::default(),
            two_sided: false,
        }
    }
}

impl MaskPolicy {
    /// Short name used in logs, errors and persisted file names.
    pub fn name(&self) -> &'static str {
        match self {
            MaskPolicy::Threshold { .. } => "threshold",
            MaskPolicy::Weighted => "weighted",
        }
    }
}

// ---------------------------------------------------------------------------
// Mask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    /// Values in {0, 1}.
    Binary,
    /// Non-negative real weights.
    Weighted,
}

/// A 3D mask derived from exactly one component, on the component's grid.
#[derive(Debug, Clone)]
pub struct Mask {
    pub kind: MaskKind,
    pub values: Array3<f64>,
    pub frame: SpatialFrame,
}

impl Mask {
    pub fn spatial_shape(&self) -> [usize; 3] {
        let (x, y, z) = self.values.dim();
        [x, y, z]
    }

    /// Number of voxels with a nonzero value.
    pub fn support(&self) -> usize {
        self.values.iter().filter(|&&v| v != 0.0).count()
    }

    pub fn total_weight(&self) -> f64 {
        self.values.sum()
    }

    pub fn to_volume(&self) -> Volume {
        Volume::from_3d(self.values.clone(), self.frame)
    }
}

/// Build the mask of `component` under `policy`.
pub fn extract(component: &Volume, policy: &MaskPolicy) -> Result<Mask> {
    let values = component.view_3d()?.to_owned();

    match *policy {
        MaskPolicy::Threshold {
            threshold,
            two_sided,
        } => {
            let cutoff = threshold.resolve(&values, two_sided)?;
            // One-sided masks only ever hold positive voxels, whatever the cutoff.
            let binary = values.mapv(|v| {
                let kept = if two_sided {
                    v != 0.0 && v.abs() >= cutoff
                } else {
                    v > 0.0 && v >= cutoff
                };
                if kept {
                    1.0
                } else {
                    0.0
                }
            });
            let mask = Mask {
                kind: MaskKind::Binary,
                values: binary,
                frame: component.frame,
            };
            if mask.support() == 0 {
                return Err(RoiError::InvalidThreshold {
                    reason: format!("threshold {threshold} (cutoff {cutoff}) selects no voxels"),
                });
            }
            log::debug!(
                "threshold {threshold} -> cutoff {cutoff:.6}, {} voxels in mask",
                mask.support()
            );
            Ok(mask)
        }
        MaskPolicy::Weighted => {
            // NaN weights are left as-is; they surface in the reduction.
            let clipped = values.mapv(|v| if v < 0.0 { 0.0 } else { v });
            Ok(Mask {
                kind: MaskKind::Weighted,
                values: clipped,
                frame: component.frame,
            })
        }
    }
}
