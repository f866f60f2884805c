use ndarray::{Array3, Array4};

use ica_roi::config::RunConfig;
use ica_roi::data::loader::{load_volume, save_volume};
use ica_roi::data::model::{ComponentSet, SpatialFrame, SubjectStack, Volume};
use ica_roi::decompose::{ComponentDecomposer, FastIca};
use ica_roi::mask::{MaskPolicy, ThresholdSpec};
use ica_roi::pipeline::{Execution, ReductionPipeline};
use ica_roi::RoiError;

const GRID: (usize, usize, usize) = (4, 4, 2);
const TOL: f64 = 1e-9;

/// Component 0: an all-positive blob. Component 1: a positive lobe next to
/// a planted negative lobe.
fn components() -> ComponentSet {
    let mut a = Array3::zeros(GRID);
    a[[0, 0, 0]] = 4.0;
    a[[0, 1, 0]] = 2.0;
    a[[1, 0, 0]] = 2.0;
    a[[1, 1, 0]] = 1.0;

    let mut b = Array3::zeros(GRID);
    b[[2, 2, 1]] = 3.0;
    b[[3, 2, 1]] = 1.0;
    b[[2, 3, 1]] = -5.0;
    b[[3, 3, 1]] = -2.0;

    ComponentSet::new(vec![
        Volume::from_3d(a, SpatialFrame::default()),
        Volume::from_3d(b, SpatialFrame::default()),
    ])
}

/// Subject j: 10 * (j + 1) + x + 2y + 4z.
fn subjects() -> SubjectStack {
    let data = Array4::from_shape_fn((GRID.0, GRID.1, GRID.2, 3), |(x, y, z, j)| {
        10.0 * (j + 1) as f64 + x as f64 + 2.0 * y as f64 + 4.0 * z as f64
    });
    SubjectStack::new(data, SpatialFrame::default())
}

fn threshold(t: f64, two_sided: bool) -> MaskPolicy {
    MaskPolicy::Threshold {
        threshold: ThresholdSpec::Absolute(t),
        two_sided,
    }
}

fn assert_rows(actual: &ica_roi::data::model::ResultMatrix, expected: &[[f64; 3]]) {
    assert_eq!(actual.shape(), (expected.len(), 3));
    for (i, row) in expected.iter().enumerate() {
        for (j, &want) in row.iter().enumerate() {
            let got = actual.get(i, j).unwrap();
            assert!((got - want).abs() < TOL, "[{i}, {j}]: got {got}, want {want}");
        }
    }
}

#[test]
fn mean_in_mask_matches_hand_computation() {
    let out = ReductionPipeline::new(threshold(0.5, false))
        .run(&components(), &subjects())
        .unwrap();
    // blob offsets {0, 2, 1, 3} -> 1.5; positive lobe offsets {10, 11} -> 10.5
    assert_rows(&out.matrix, &[[11.5, 21.5, 31.5], [20.5, 30.5, 40.5]]);
}

#[test]
fn weighted_sum_matches_hand_computation() {
    let out = ReductionPipeline::new(MaskPolicy::Weighted)
        .run(&components(), &subjects())
        .unwrap();
    // blob: (4*0 + 2*2 + 2*1 + 1*3) / 9 = 1; lobe: (3*10 + 1*11) / 4 = 10.25,
    // the negative lobe contributes nothing
    assert_rows(&out.matrix, &[[11.0, 21.0, 31.0], [20.25, 30.25, 40.25]]);
}

#[test]
fn two_sided_threshold_picks_up_the_negative_lobe() {
    let one_sided = ReductionPipeline::new(threshold(2.5, false))
        .run(&components(), &subjects())
        .unwrap();
    let two_sided = ReductionPipeline::new(threshold(2.5, true))
        .run(&components(), &subjects())
        .unwrap();

    // component 1: only the 3.0 voxel (offset 10) vs. 3.0 and -5.0 (offsets 10, 12)
    assert_rows(&one_sided.matrix, &[[10.0, 20.0, 30.0], [20.0, 30.0, 40.0]]);
    assert_rows(&two_sided.matrix, &[[10.0, 20.0, 30.0], [21.0, 31.0, 41.0]]);
}

#[test]
fn parallel_execution_gives_the_same_table() {
    let seq = ReductionPipeline::new(threshold(0.5, false))
        .run(&components(), &subjects())
        .unwrap();
    let par = ReductionPipeline::new(threshold(0.5, false))
        .with_execution(Execution::Parallel)
        .run(&components(), &subjects())
        .unwrap();
    assert_eq!(seq.matrix, par.matrix);
}

#[test]
fn all_negative_component_is_degenerate_under_weighting() {
    let negative = ComponentSet::new(vec![Volume::from_3d(
        Array3::from_elem(GRID, -1.0),
        SpatialFrame::default(),
    )]);
    let err = ReductionPipeline::new(MaskPolicy::Weighted)
        .run(&negative, &subjects())
        .unwrap_err();
    assert!(matches!(err.root(), RoiError::DegenerateMask { .. }));
    assert!(err.to_string().contains("component 0"));
}

#[test]
fn config_driven_run_persists_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    save_volume(&components().to_volume().unwrap(), &dir.path().join("ics.json")).unwrap();
    save_volume(
        &Volume::from_4d(
            Array4::from_shape_fn((GRID.0, GRID.1, GRID.2, 3), |(x, y, z, j)| {
                10.0 * (j + 1) as f64 + x as f64 + 2.0 * y as f64 + 4.0 * z as f64
            }),
            SpatialFrame::default(),
        ),
        &dir.path().join("subjects.json"),
    )
    .unwrap();

    let config_path = dir.path().join("run.json");
    std::fs::write(
        &config_path,
        r#"{
            "group": "HC",
            "subjects": "subjects.json",
            "components": { "file": "ics.json" },
            "mask_policy": { "kind": "weighted" },
            "output_dir": "out"
        }"#,
    )
    .unwrap();

    let config = RunConfig::load(&config_path).unwrap();
    let comps = ComponentSet::from_volume(&load_volume(&dir.path().join("ics.json")).unwrap());
    let subs = SubjectStack::from_volume(load_volume(&config.subjects).unwrap()).unwrap();
    let out = config.pipeline().run(&comps, &subs).unwrap();
    assert_rows(&out.matrix, &[[11.0, 21.0, 31.0], [20.25, 30.25, 40.25]]);

    let out_dir = dir.path().join("out");
    for i in 0..2 {
        let mask = load_volume(&out_dir.join(format!("masks/IC_HC_{i}.nii.gz"))).unwrap();
        assert_eq!(mask.shape(), &[GRID.0, GRID.1, GRID.2]);
        assert!(mask.data.iter().all(|&v| v >= 0.0));
        assert!(out_dir
            .join(format!("masked_data/masked_HC_weighted_{i}.txt"))
            .is_file());
    }
}

#[test]
fn decomposed_components_feed_the_pipeline() {
    let sources = components();
    let weights = [[1.0, 0.3], [0.2, 1.0], [0.7, 0.6], [1.1, 0.1]];
    let images: Vec<Volume> = weights
        .iter()
        .enumerate()
        .map(|(n, &[wa, wb])| {
            let a = sources.get(0).unwrap().view_3d().unwrap().to_owned();
            let b = sources.get(1).unwrap().view_3d().unwrap().to_owned();
            let jitter = Array3::from_shape_fn(GRID, |(x, y, z)| {
                0.01 * (((x * 7 + y * 3 + z * 5 + n * 11) % 13) as f64 - 6.0)
            });
            Volume::from_3d(a * wa + b * wb + jitter, SpatialFrame::default())
        })
        .collect();

    let comps = FastIca::with_seed(1).decompose(&images, 2).unwrap();
    assert_eq!(comps.len(), 2);

    let out = ReductionPipeline::new(MaskPolicy::Weighted)
        .run(&comps, &subjects())
        .unwrap();
    assert_eq!(out.matrix.shape(), (2, 3));
    assert!(out.matrix.values().iter().all(|v| v.is_finite()));
}
