use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::decompose::FastIca;
use crate::mask::MaskPolicy;
use crate::pipeline::{Execution, FailureMode, ReductionPipeline};

// ---------------------------------------------------------------------------
// RunConfig – one masking/reduction run, read from JSON
// ---------------------------------------------------------------------------

/// Example:
///
/// ```json
/// {
///   "group": "PD",
///   "subjects": "dbm_maps.nii.gz",
///   "components": { "decompose": { "images": ["dbm_maps.nii.gz"], "n_components": 30 } },
///   "mask_policy": { "kind": "threshold", "threshold": "99.6%" },
///   "output_dir": "io"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Cohort label used in every persisted file name.
    #[serde(default)]
    pub group: String,
    /// 4D stack of per-subject maps (subject axis last).
    pub subjects: PathBuf,
    pub components: ComponentSource,
    #[serde(default)]
    pub mask_policy: MaskPolicy,
    /// Absent: no masks, snapshots or tables are written.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub execution: Execution,
    #[serde(default)]
    pub on_failure: FailureMode,
}

/// Where the spatial components come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentSource {
    /// A precomputed 4D image, component axis last.
    File(PathBuf),
    /// Run FastICA on the listed images.
    Decompose(DecomposeConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposeConfig {
    /// 3D images or pre-concatenated 4D images on one grid.
    pub images: Vec<PathBuf>,
    #[serde(default = "default_n_components")]
    pub n_components: usize,
    /// Label for the `ICAs_<group>_<iteration>` file.
    #[serde(default)]
    pub iteration: String,
    #[serde(default)]
    pub ica: FastIca,
    /// Directory for the components image; defaults to `<output_dir>/ICAs`.
    #[serde(default)]
    pub save_to: Option<PathBuf>,
}

fn default_n_components() -> usize {
    30
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: RunConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.resolve_relative_to(path.parent().unwrap_or(Path::new("")));
        config.validate()?;
        Ok(config)
    }

    /// Make relative paths relative to the config file's directory.
    fn resolve_relative_to(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.subjects);
        if let Some(dir) = self.output_dir.as_mut() {
            fix(dir);
        }
        match &mut self.components {
            ComponentSource::File(p) => fix(p),
            ComponentSource::Decompose(d) => {
                d.images.iter_mut().for_each(fix);
                if let Some(dir) = d.save_to.as_mut() {
                    fix(dir);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let MaskPolicy::Threshold { threshold, .. } = &self.mask_policy {
            threshold.validate()?;
        }
        if let ComponentSource::Decompose(d) = &self.components {
            if d.images.is_empty() {
                bail!("decompose: no input images listed");
            }
            if d.n_components == 0 {
                bail!("decompose: n_components must be at least 1");
            }
        }
        Ok(())
    }

    /// Directory for the decomposition output, if any.
    pub fn ica_dir(&self) -> Option<PathBuf> {
        match &self.components {
            ComponentSource::Decompose(d) => d
                .save_to
                .clone()
                .or_else(|| self.output_dir.as_ref().map(|dir| dir.join("ICAs"))),
            ComponentSource::File(_) => None,
        }
    }

    pub fn pipeline(&self) -> ReductionPipeline {
        let pipeline = ReductionPipeline::new(self.mask_policy)
            .with_group(self.group.clone())
            .with_execution(self.execution)
            .with_failure_mode(self.on_failure);
        match &self.output_dir {
            Some(dir) => pipeline.with_output_dir(dir),
            None => pipeline,
        }
    }
}
