//! Voxel-intensity summary of a 4D stack.

use std::fmt;

use crate::data::model::{format_shape, Volume};
use crate::stats::{self, Histogram};

/// Bins used for the per-image distributions.
pub const HISTOGRAM_BINS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub max: f64,
    pub mean: f64,
    pub min: f64,
}

impl Summary {
    fn of(values: impl Iterator<Item = f64> + Clone) -> Self {
        Summary {
            max: stats::nan_max(values.clone()),
            mean: stats::nan_mean(values.clone()),
            min: stats::nan_min(values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Maximum,
    Mean,
    Minimum,
}

impl Statistic {
    pub const ALL: [Statistic; 3] = [Statistic::Maximum, Statistic::Mean, Statistic::Minimum];

    pub fn name(self) -> &'static str {
        match self {
            Statistic::Maximum => "Maximum",
            Statistic::Mean => "Mean",
            Statistic::Minimum => "Minimum",
        }
    }

    fn pick(self, s: &Summary) -> f64 {
        match self {
            Statistic::Maximum => s.max,
            Statistic::Mean => s.mean,
            Statistic::Minimum => s.min,
        }
    }
}

/// Global and per-image (last axis) max/mean/min, all NaN-aware.
#[derive(Debug, Clone)]
pub struct IntensityReport {
    pub shape: Vec<usize>,
    pub global: Summary,
    pub per_image: Vec<Summary>,
}

impl IntensityReport {
    pub fn from_volume(volume: &Volume) -> Self {
        let per_image = volume
            .iter_images()
            .map(|img| Summary::of(img.data.iter().copied()))
            .collect();
        IntensityReport {
            shape: volume.shape().to_vec(),
            global: Summary::of(volume.data.iter().copied()),
            per_image,
        }
    }

    /// The per-image values of one statistic, in image order.
    pub fn distribution(&self, stat: Statistic) -> Vec<f64> {
        self.per_image.iter().map(|s| stat.pick(s)).collect()
    }

    pub fn histogram(&self, stat: Statistic) -> Histogram {
        Histogram::new(&self.distribution(stat), HISTOGRAM_BINS)
    }
}

impl fmt::Display for IntensityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "======== data ========")?;
        writeln!(f, " f64 volume, shape {}", format_shape(&self.shape))?;

        for stat in Statistic::ALL {
            let name = stat.name();
            writeln!(f, "======== {name} ========")?;
            writeln!(f, "Overall {name}: {:.2}", stat.pick(&self.global))?;
            writeln!(f, "{name} values along images:")?;

            let hist = self.histogram(stat);
            let peak = hist.counts.iter().copied().max().unwrap_or(0).max(1);
            for (i, &count) in hist.counts.iter().enumerate() {
                let bar = "#".repeat(count * 40 / peak);
                writeln!(
                    f,
                    "  [{:>10.2}, {:>10.2}{} {count:>5} {bar}",
                    hist.edges[i],
                    hist.edges[i + 1],
                    if i + 1 == hist.counts.len() { ']' } else { ')' },
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::SpatialFrame;
    use ndarray::Array4;

    fn stack() -> Volume {
        // image t holds values t*10 .. t*10 + 7
        let mut data = Array4::from_shape_fn((2, 2, 2, 3), |(x, y, z, t)| {
            (t * 10 + x * 4 + y * 2 + z) as f64
        });
        data[[0, 0, 0, 2]] = f64::NAN;
        Volume::from_4d(data, SpatialFrame::default())
    }

    #[test]
    fn global_and_per_image_statistics() {
        let report = IntensityReport::from_volume(&stack());
        assert_eq!(report.global.max, 27.0);
        assert_eq!(report.global.min, 0.0);
        assert_eq!(report.per_image.len(), 3);
        assert_eq!(report.per_image[0].mean, 3.5);
        assert_eq!(report.per_image[2].min, 21.0);
        assert_eq!(report.distribution(Statistic::Maximum), vec![7.0, 17.0, 27.0]);
    }

    #[test]
    fn histograms_have_three_bins() {
        let report = IntensityReport::from_volume(&stack());
        for stat in Statistic::ALL {
            let h = report.histogram(stat);
            assert_eq!(h.counts.len(), HISTOGRAM_BINS);
            assert_eq!(h.counts.iter().sum::<usize>(), 3);
        }
    }

    #[test]
    fn display_lists_every_statistic() {
        let text = IntensityReport::from_volume(&stack()).to_string();
        for name in ["Maximum", "Mean", "Minimum"] {
            assert!(text.contains(&format!("Overall {name}")), "{text}");
        }
        assert!(text.contains("Overall Maximum: 27.00"));
    }
}
