use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ica_roi::config::{ComponentSource, RunConfig};
use ica_roi::data::loader::{load_volume, save_matrix_csv};
use ica_roi::data::model::{ComponentSet, SubjectStack, Volume};
use ica_roi::decompose::{decompose_and_save, ComponentDecomposer, FastIca};
use ica_roi::report::IntensityReport;

#[derive(Parser)]
#[command(name = "ica-roi")]
#[command(about = "Regional summaries of brain maps from ICA spatial components")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mask and reduce subject maps as described by a JSON run config
    Run {
        /// Run configuration file
        config: PathBuf,
    },

    /// Decompose a cohort into spatial components
    Decompose {
        /// Input images (3D, or 4D with images along the last axis)
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Number of components
        #[arg(short, long, default_value = "30")]
        n_components: usize,

        /// Output directory for ICAs_<group>_<iteration>.nii.gz
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "")]
        group: String,

        #[arg(long, default_value = "0")]
        iteration: String,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Print max/mean/min intensity statistics of a 4D image
    Report {
        /// Image file
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Run { config } => run(&RunConfig::load(&config)?),
        Commands::Decompose {
            images,
            n_components,
            output,
            group,
            iteration,
            seed,
        } => {
            let volumes = load_all(&images)?;
            let (_, path) = decompose_and_save(
                &FastIca::with_seed(seed),
                &volumes,
                n_components,
                &output,
                &group,
                &iteration,
            )?;
            println!("Wrote {n_components} components to {}", path.display());
            Ok(())
        }
        Commands::Report { image } => {
            let volume = load_volume(&image)?;
            print!("{}", IntensityReport::from_volume(&volume));
            Ok(())
        }
    }
}

fn load_all(paths: &[PathBuf]) -> Result<Vec<Volume>> {
    paths.iter().map(|p| load_volume(p)).collect()
}

fn run(config: &RunConfig) -> Result<()> {
    let components = match &config.components {
        ComponentSource::File(path) => ComponentSet::from_volume(&load_volume(path)?),
        ComponentSource::Decompose(d) => {
            let images = load_all(&d.images)?;
            match config.ica_dir() {
                Some(dir) => {
                    decompose_and_save(
                        &d.ica,
                        &images,
                        d.n_components,
                        &dir,
                        &config.group,
                        &d.iteration,
                    )?
                    .0
                }
                None => d.ica.decompose(&images, d.n_components)?,
            }
        }
    };

    let subjects = SubjectStack::from_volume(load_volume(&config.subjects)?)
        .context("loading subject stack")?;

    let outcome = config.pipeline().run(&components, &subjects)?;
    for failure in &outcome.failures {
        eprintln!("component {} skipped: {}", failure.index, failure.error);
    }

    let (n_components, n_subjects) = outcome.matrix.shape();
    println!(
        "Reduced {n_components} components × {n_subjects} subjects ({} NaN cells)",
        outcome.nan_cells
    );
    for (i, row) in outcome.matrix.values().rows().into_iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|v| format!("{v:.4}")).collect();
        println!("IC {i:>3}: {}", cells.join(" "));
    }

    if let Some(dir) = &config.output_dir {
        let path = dir.join(format!(
            "results_{}_{}.csv",
            config.group,
            config.mask_policy.name()
        ));
        save_matrix_csv(outcome.matrix.values(), &path)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}
