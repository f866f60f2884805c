use std::path::PathBuf;

use anyhow::{Context, Result};
use ndarray::{Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

use ica_roi::config::{ComponentSource, DecomposeConfig, RunConfig};
use ica_roi::data::loader::save_volume;
use ica_roi::data::model::{SpatialFrame, Volume};
use ica_roi::decompose::FastIca;
use ica_roi::mask::MaskPolicy;

const GRID: (usize, usize, usize) = (20, 24, 16);
const VOXEL_MM: f64 = 2.0;

fn gaussian(d2: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-d2 / (2.0 * sigma.powi(2))).exp()
}

/// One spatial source: a Gaussian blob at `center` (voxel coordinates).
fn blob(center: (f64, f64, f64), sigma: f64) -> Array3<f64> {
    Array3::from_shape_fn(GRID, |(x, y, z)| {
        let d2 = (x as f64 - center.0).powi(2)
            + (y as f64 - center.1).powi(2)
            + (z as f64 - center.2).powi(2);
        gaussian(d2, sigma, 1.0)
    })
}

fn mix(sources: &[Array3<f64>], weights: &[f64], noise: Normal<f64>, rng: &mut StdRng) -> Array3<f64> {
    let mut out = Array3::zeros(GRID);
    for (source, &w) in sources.iter().zip(weights) {
        out.scaled_add(w, source);
    }
    out.mapv_inplace(|v| v + rng.sample(noise));
    out
}

fn stack(images: Vec<Array3<f64>>) -> Result<Array4<f64>> {
    let views: Vec<_> = images.iter().map(|img| img.view()).collect();
    ndarray::stack(Axis(3), &views).context("stacking images")
}

fn main() -> Result<()> {
    env_logger::init();
    let mut rng = StdRng::seed_from_u64(42);
    let cohort_noise = Normal::new(0.0, 0.02)?;
    let subject_noise = Normal::new(0.0, 0.05)?;

    let out_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sample_data"));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let dims = [GRID.0, GRID.1, GRID.2];
    let mut frame = SpatialFrame::default();
    for axis in 0..3 {
        frame.affine[axis * 5] = VOXEL_MM;
        frame.affine[axis * 4 + 3] = -(dims[axis] as f64) * VOXEL_MM / 2.0;
    }

    let sources = vec![
        blob((5.0, 6.0, 4.0), 2.0),
        blob((14.0, 8.0, 10.0), 2.5),
        blob((10.0, 18.0, 7.0), 1.8),
    ];

    // Cohort used for the decomposition: random mixtures of the sources.
    let cohort: Vec<Array3<f64>> = (0..12)
        .map(|_| {
            let weights: Vec<f64> = (0..sources.len()).map(|_| rng.gen_range(0.0..2.0)).collect();
            mix(&sources, &weights, cohort_noise, &mut rng)
        })
        .collect();
    let cohort_path = out_dir.join("cohort.nii.gz");
    save_volume(&Volume::from_4d(stack(cohort)?, frame), &cohort_path)?;

    // Subject maps: baseline plus subject-specific source amplitudes.
    let n_subjects = 8;
    let subjects: Vec<Array3<f64>> = (0..n_subjects)
        .map(|j| {
            let weights: Vec<f64> = (0..sources.len())
                .map(|s| 1.0 + 0.1 * j as f64 * (s as f64 - 1.0) + rng.sample(subject_noise))
                .collect();
            mix(&sources, &weights, subject_noise, &mut rng).mapv(|v| v + 1.0)
        })
        .collect();
    let subjects_path = out_dir.join("subjects.nii.gz");
    save_volume(&Volume::from_4d(stack(subjects)?, frame), &subjects_path)?;

    let config = RunConfig {
        group: "sample".to_string(),
        subjects: PathBuf::from("subjects.nii.gz"),
        components: ComponentSource::Decompose(DecomposeConfig {
            images: vec![PathBuf::from("cohort.nii.gz")],
            n_components: sources.len(),
            iteration: "0".to_string(),
            ica: FastIca::default(),
            save_to: None,
        }),
        mask_policy: MaskPolicy::default(),
        output_dir: Some(PathBuf::from("out")),
        execution: Default::default(),
        on_failure: Default::default(),
    };
    let config_path = out_dir.join("run.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", config_path.display()))?;

    println!(
        "Wrote 12 cohort images and {n_subjects} subject maps ({}x{}x{}) to {}",
        GRID.0,
        GRID.1,
        GRID.2,
        out_dir.display()
    );
    println!("Run with: ica-roi run {}", config_path.display());
    Ok(())
}
