use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{ArrayD, ArrayView2, IxDyn};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use serde::{Deserialize, Serialize};

use super::model::{SpatialFrame, Volume};

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// On-disk volume formats, chosen by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeFormat {
    Nifti,
    NiftiGz,
    Json,
}

fn volume_format(path: &Path) -> Result<VolumeFormat> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    if name.ends_with(".nii.gz") {
        Ok(VolumeFormat::NiftiGz)
    } else if name.ends_with(".nii") {
        Ok(VolumeFormat::Nifti)
    } else if name.ends_with(".json") {
        Ok(VolumeFormat::Json)
    } else {
        bail!("Unsupported volume file: {}", path.display())
    }
}

/// Load a 3D or 4D volume. Dispatch by file name.
///
/// Supported formats:
/// * `.nii` / `.nii.gz` – NIfTI-1 (any on-disk datatype, read as f64)
/// * `.json`            – `{ "shape": [...], "data": [...], "affine": [...] }`
pub fn load_volume(path: &Path) -> Result<Volume> {
    let volume = match volume_format(path)? {
        VolumeFormat::Nifti | VolumeFormat::NiftiGz => load_nifti(path),
        VolumeFormat::Json => load_json(path),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::debug!(
        "loaded {} with shape {:?}",
        path.display(),
        volume.shape()
    );
    Ok(volume)
}

/// Write a volume; the format follows the file name as in [`load_volume`].
pub fn save_volume(volume: &Volume, path: &Path) -> Result<()> {
    match volume_format(path)? {
        VolumeFormat::Nifti => {
            let bytes = nifti_bytes(volume)?;
            std::fs::write(path, bytes)
                .with_context(|| format!("writing {}", path.display()))
        }
        VolumeFormat::NiftiGz => {
            let bytes = nifti_bytes(volume)?;
            let file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            encoder.write_all(&bytes).context("gzip compression")?;
            encoder.finish().context("finishing gzip stream")?;
            Ok(())
        }
        VolumeFormat::Json => save_json(volume, path),
    }
}

// ---------------------------------------------------------------------------
// NIfTI
// ---------------------------------------------------------------------------

fn load_nifti(path: &Path) -> Result<Volume> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .context("reading NIfTI file")?;
    let frame = frame_from_header(obj.header());
    let data: ArrayD<f64> = obj
        .into_volume()
        .into_ndarray::<f64>()
        .context("converting NIfTI volume to f64 array")?;

    if !(3..=4).contains(&data.ndim()) {
        bail!("Expected a 3D or 4D image, got {}D", data.ndim());
    }
    Ok(Volume::new(data, frame))
}

/// Prefer the sform; fall back to voxel-size scaling.
fn frame_from_header(header: &NiftiHeader) -> SpatialFrame {
    if header.sform_code > 0 {
        let (x, y, z) = (&header.srow_x, &header.srow_y, &header.srow_z);
        #[rustfmt::skip]
        let affine = [
            x[0] as f64, x[1] as f64, x[2] as f64, x[3] as f64,
            y[0] as f64, y[1] as f64, y[2] as f64, y[3] as f64,
            z[0] as f64, z[1] as f64, z[2] as f64, z[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ];
        SpatialFrame { affine }
    } else {
        let mut frame = SpatialFrame::default();
        for axis in 0..3 {
            let size = header.pixdim[axis + 1] as f64;
            if size > 0.0 {
                frame.affine[axis * 5] = size;
            }
        }
        frame
    }
}

const NIFTI_HEADER_SIZE: usize = 348;
const NIFTI_VOX_OFFSET: usize = 352;
const DT_FLOAT64: i16 = 64;

/// Serialize as a single-file NIfTI-1 (`n+1`) image with float64 voxels.
fn nifti_bytes(volume: &Volume) -> Result<Vec<u8>> {
    let shape = volume.shape();
    if !(3..=4).contains(&shape.len()) {
        bail!("Only 3D or 4D volumes can be written as NIfTI, got {shape:?}");
    }

    let mut header = [0u8; NIFTI_HEADER_SIZE];
    header[0..4].copy_from_slice(&(NIFTI_HEADER_SIZE as i32).to_le_bytes());
    header[38] = b'r';

    let mut dim = [1i16; 8];
    dim[0] = shape.len() as i16;
    for (i, &d) in shape.iter().enumerate() {
        dim[i + 1] = i16::try_from(d).context("dimension too large for NIfTI-1")?;
    }
    for (i, d) in dim.iter().enumerate() {
        let at = 40 + i * 2;
        header[at..at + 2].copy_from_slice(&d.to_le_bytes());
    }

    header[70..72].copy_from_slice(&DT_FLOAT64.to_le_bytes());
    header[72..74].copy_from_slice(&64i16.to_le_bytes());

    let affine = &volume.frame.affine;
    let mut pixdim = [1.0f32; 8];
    for axis in 0..3 {
        let col = [affine[axis], affine[4 + axis], affine[8 + axis]];
        pixdim[axis + 1] = col.iter().map(|v| v * v).sum::<f64>().sqrt() as f32;
    }
    for (i, p) in pixdim.iter().enumerate() {
        let at = 76 + i * 4;
        header[at..at + 4].copy_from_slice(&p.to_le_bytes());
    }

    header[108..112].copy_from_slice(&(NIFTI_VOX_OFFSET as f32).to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    // sform_code = 1 (scanner anatomical)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let at = 280 + row * 16 + col * 4;
            header[at..at + 4].copy_from_slice(&(affine[row * 4 + col] as f32).to_le_bytes());
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(NIFTI_VOX_OFFSET + volume.data.len() * 8);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);
    // NIfTI stores x fastest: iterate the axis-reversed view in logical order.
    for v in volume.data.t().iter() {
        buffer.extend_from_slice(&v.to_le_bytes());
    }
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// JSON volume layout. `data` is row-major (last axis fastest); `null`
/// stands for NaN since JSON has no representation for it.
#[derive(Debug, Serialize, Deserialize)]
struct JsonVolume {
    shape: Vec<usize>,
    data: Vec<Option<f64>>,
    #[serde(default)]
    affine: Option<[f64; 16]>,
}

fn load_json(path: &Path) -> Result<Volume> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let parsed: JsonVolume = serde_json::from_str(&text).context("parsing JSON volume")?;

    let expected: usize = parsed.shape.iter().product();
    if parsed.data.len() != expected {
        bail!(
            "shape {:?} needs {expected} values but data has {}",
            parsed.shape,
            parsed.data.len()
        );
    }
    let values: Vec<f64> = parsed
        .data
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    let data = ArrayD::from_shape_vec(IxDyn(&parsed.shape), values)
        .context("building array from JSON data")?;
    let frame = parsed
        .affine
        .map(|affine| SpatialFrame { affine })
        .unwrap_or_default();
    Ok(Volume::new(data, frame))
}

fn save_json(volume: &Volume, path: &Path) -> Result<()> {
    let out = JsonVolume {
        shape: volume.shape().to_vec(),
        data: volume
            .data
            .iter()
            .map(|&v| if v.is_nan() { None } else { Some(v) })
            .collect(),
        affine: Some(volume.frame.affine),
    };
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &out).context("writing JSON volume")?;
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Result tables
// ---------------------------------------------------------------------------

/// Whitespace-separated rows of doubles in `%.18e` notation.
pub fn save_matrix_txt(matrix: ArrayView2<'_, f64>, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for row in matrix.rows() {
        let line: Vec<String> = row.iter().map(|&v| format_scientific(v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    out.flush()?;
    Ok(())
}

/// Final table as CSV: one row per component, one column per subject.
pub fn save_matrix_csv(matrix: ArrayView2<'_, f64>, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("opening CSV for writing")?;

    let mut header = vec!["component".to_string()];
    header.extend((0..matrix.ncols()).map(|j| format!("subject_{j}")));
    writer.write_record(&header)?;

    for (i, row) in matrix.rows().into_iter().enumerate() {
        let mut record = vec![i.to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// `1.5` → `1.500000000000000000e+00`; non-finite values as `nan` / `inf`.
fn format_scientific(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let s = format!("{v:.18e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => s,
    }
}
