//! Measurement output files.
//!
//! Every run writes a tab-separated raw data file with one row per averaged
//! point. Charge/discharge and rate runs also write a capacity summary next to
//! it (`<stem>_capacities.<ext>`).

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::params::OutputTarget;

const RAW_HEADER: &str = "Elapsed time(s)\tPotential(V)\tCurrent(A)";
const CYCLE_CAPACITY_HEADER: &str = "Cycle number\tCharge capacity (Ah)\tDischarge capacity (Ah)";
const RATE_CAPACITY_HEADER: &str = "C-rate\tCharge capacity (Ah)\tDischarge capacity (Ah)";

/// Format like C's `%e`: six fractional digits and a signed exponent of at
/// least two digits.
pub fn format_sci(value: f64) -> String {
    let s = format!("{:.6e}", value);
    match s.split_once('e') {
        Some((mantissa, exponent)) => {
            let exp: i32 = exponent.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => s.to_lowercase(),
    }
}

/// Path of the capacity summary for a raw data path.
pub fn capacities_path(raw: &Path) -> PathBuf {
    let stem = raw
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match raw.extension() {
        Some(ext) => format!("{}_capacities.{}", stem, ext.to_string_lossy()),
        None => format!("{}_capacities", stem),
    };
    raw.with_file_name(name)
}

fn file_error(path: &Path, kind: ErrorKind, msg: &str) -> DriverError {
    DriverError::file(path, io::Error::new(kind, msg.to_string()))
}

/// Check that a run may write to `target` before anything touches the
/// hardware. Leaves the file system untouched.
pub fn validate_output_path(target: &OutputTarget) -> Result<()> {
    let path = &target.path;
    if path.as_os_str().is_empty() {
        return Err(DriverError::parameter("no output file specified"));
    }
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    if !dir.is_dir() {
        return Err(file_error(path, ErrorKind::NotFound, "the output directory does not exist"));
    }
    match fs::metadata(path) {
        Ok(_) if !target.overwrite => Err(file_error(
            path,
            ErrorKind::AlreadyExists,
            "the output file already exists and overwriting was not requested",
        )),
        Ok(meta) if meta.is_dir() => Err(file_error(
            path,
            ErrorKind::InvalidInput,
            "the output path is a directory",
        )),
        Ok(meta) if meta.permissions().readonly() => Err(file_error(
            path,
            ErrorKind::PermissionDenied,
            "the output file is read-only",
        )),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DriverError::file(path, e)),
    }
}

/// Output files of a run that did not exist before it started.
#[derive(Debug)]
pub(crate) struct FreshOutputs {
    paths: Vec<PathBuf>,
}

impl FreshOutputs {
    pub(crate) fn new(target: &OutputTarget) -> Self {
        let paths = [target.path.clone(), capacities_path(&target.path)]
            .into_iter()
            .filter(|p| !p.exists())
            .collect();
        Self { paths }
    }

    /// Remove whatever a failed start left behind, so a retry is not refused.
    pub(crate) fn discard(self) {
        for path in self.paths {
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove {}: {e}", path.display()),
            }
        }
    }
}

fn create(path: &Path, header: &str) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| DriverError::file(path, e))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", header)
        .and_then(|_| writer.flush())
        .map_err(|e| DriverError::file(path, e))?;
    debug!("opened output file {}", path.display());
    Ok(writer)
}

/// Raw (time, potential, current) data file.
pub struct RawDataWriter {
    path: PathBuf,
    writer: Box<dyn Write + Send>,
}

impl fmt::Debug for RawDataWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDataWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RawDataWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = create(path, RAW_HEADER)?;
        Ok(Self::from_writer(path, Box::new(writer)))
    }

    /// Write rows to an already open stream; errors are reported against
    /// `path`. No header is written.
    pub fn from_writer(path: impl Into<PathBuf>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            path: path.into(),
            writer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time in s, potential in V, current in A.
    pub fn write_point(&mut self, time_s: f64, potential_v: f64, current_a: f64) -> Result<()> {
        writeln!(
            self.writer,
            "{}\t{}\t{}",
            format_sci(time_s),
            format_sci(potential_v),
            format_sci(current_a)
        )
        .and_then(|_| self.writer.flush())
        .map_err(|e| DriverError::file(&self.path, e))
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| DriverError::file(&self.path, e))
    }
}

/// Which capacity table a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLayout {
    /// Cycle number, charge, discharge
    Cycle,
    /// C-rate, charge, discharge
    Rate,
}

/// Capacity summary file.
#[derive(Debug)]
pub struct CapacityWriter {
    path: PathBuf,
    layout: CapacityLayout,
    writer: BufWriter<File>,
}

impl CapacityWriter {
    /// Create the summary file belonging to the raw data file at `raw`.
    pub fn create_for(raw: &Path, layout: CapacityLayout) -> Result<Self> {
        let path = capacities_path(raw);
        let header = match layout {
            CapacityLayout::Cycle => CYCLE_CAPACITY_HEADER,
            CapacityLayout::Rate => RATE_CAPACITY_HEADER,
        };
        let writer = create(&path, header)?;
        Ok(Self {
            path,
            layout,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one row; `key` is the cycle number or the C-rate depending on the
    /// layout. Capacities in Ah.
    pub fn write_row(&mut self, key: f64, charge_ah: f64, discharge_ah: f64) -> Result<()> {
        let key = match self.layout {
            CapacityLayout::Cycle => format!("{}", key as u64),
            CapacityLayout::Rate => format_sci(key),
        };
        writeln!(
            self.writer,
            "{}\t{}\t{}",
            key,
            format_sci(charge_ah),
            format_sci(discharge_ah)
        )
        .and_then(|_| self.writer.flush())
        .map_err(|e| DriverError::file(&self.path, e))
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| DriverError::file(&self.path, e))
    }
}
