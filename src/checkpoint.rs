//! Saving and loading of named parameter values.
//!
//! # `.gpck` Snapshot Format
//!
//! A snapshot stores the value buffers of a set of named parameters so a
//! training run can persist its last known-good state and resume from it.
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────────────┐
//! │ Header       │ Entry N              │ Entry N+1 …         │
//! ├──────────────┼──────────────────────┼─────────────────────┤
//! │ "gpck"[4]    │ u32: name length     │ u32: name length    │
//! │ u8: version  │ [u8] UTF-8 name      │ …                   │
//! │ u32: count   │ u64 × 3: w, h, d     │                     │
//! │              │ [f32; w·h·d] values  │                     │
//! └──────────────┴──────────────────────┴─────────────────────┘
//! ```
//!
//! Every integer and float is little-endian. Loading matches entries to
//! parameters by name, checks shapes, and copies into the existing value
//! buffers, so compiled pipelines and bound optimizers stay valid.
//!
//! # Example
//!
//! ```no_run
//! use gradpipe::{Device, Shape, checkpoint};
//!
//! # fn main() -> gradpipe::Result<()> {
//! let device = Device::cpu()?;
//! let w = device.new_parameter("w", Shape::vector(2), &[0.5, -1.0])?;
//! checkpoint::save_parameters("model.gpck", &[w.clone()])?;
//! w.set_values(&[0.0, 0.0]);
//! checkpoint::load_parameters("model.gpck", &[w.clone()])?;
//! assert_eq!(w.values(), vec![0.5, -1.0]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::node::Tensor;
use crate::shape::Shape;

const GPCK_MAGIC: &[u8; 4] = b"gpck";
const GPCK_VERSION: u8 = 1;
const MAX_NAME_LEN: usize = 1 << 16;

/// One parameter as stored in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    /// Parameter name.
    pub name: String,
    /// Shape at the time of saving.
    pub shape: Shape,
    /// Flat values, `shape.len()` of them.
    pub data: Vec<f32>,
}

fn write_u32(w: &mut impl Write, v: usize, what: &str) -> Result<()> {
    let v = u32::try_from(v)
        .map_err(|_| Error::Checkpoint(format!("{what} {v} does not fit in 32 bits")))?;
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> Result<usize> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

fn read_u64(r: &mut impl Read) -> Result<usize> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    usize::try_from(u64::from_le_bytes(buf))
        .map_err(|_| Error::Checkpoint("extent does not fit in usize".into()))
}

/// Writes the values of every tensor in `params` to `path`.
///
/// The snapshot is written to a sibling `.tmp` file and renamed over `path`
/// once complete, so a failed save leaves any previous snapshot intact.
///
/// # Errors
/// Returns [`Error::UnnamedParameter`] if a tensor has no name, and
/// [`Error::Io`] if the file cannot be written.
pub fn save_parameters(path: impl AsRef<Path>, params: &[Tensor]) -> Result<()> {
    let path = path.as_ref();
    let names = params
        .iter()
        .map(|p| p.name().ok_or(Error::UnnamedParameter))
        .collect::<Result<Vec<_>>>()?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(err) = write_snapshot(&tmp, &names, params) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    std::fs::rename(&tmp, path)?;

    log::info!("saved {} parameters to {}", params.len(), path.display());
    Ok(())
}

fn write_snapshot(path: &Path, names: &[&str], params: &[Tensor]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);

    file.write_all(GPCK_MAGIC)?;
    file.write_all(&[GPCK_VERSION])?;
    write_u32(&mut file, params.len(), "parameter count")?;

    for (name, param) in names.iter().zip(params) {
        write_u32(&mut file, name.len(), "name length")?;
        file.write_all(name.as_bytes())?;

        let shape = param.shape();
        for extent in [shape.w, shape.h, shape.d] {
            file.write_all(&(extent as u64).to_le_bytes())?;
        }

        let values = param.value().read();
        for &v in values.iter() {
            file.write_all(&v.to_le_bytes())?;
        }
    }
    file.flush()?;
    file.get_ref().sync_all()?;
    Ok(())
}

/// Reads every entry of a snapshot.
///
/// # Errors
/// Returns [`Error::Checkpoint`] for a bad header or entry, and
/// [`Error::Io`] for read failures, including truncated files.
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<Vec<SnapshotEntry>> {
    let mut file = BufReader::new(File::open(path.as_ref())?);

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != GPCK_MAGIC {
        return Err(Error::Checkpoint("invalid magic header".into()));
    }
    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != GPCK_VERSION {
        return Err(Error::Checkpoint(format!(
            "unsupported version {}",
            version[0]
        )));
    }

    let count = read_u32(&mut file)?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let name_len = read_u32(&mut file)?;
        if name_len > MAX_NAME_LEN {
            return Err(Error::Checkpoint(format!("name of {name_len} bytes")));
        }
        let mut name = vec![0u8; name_len];
        file.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::Checkpoint("parameter name is not UTF-8".into()))?;

        let shape = Shape::new(read_u64(&mut file)?, read_u64(&mut file)?, read_u64(&mut file)?);
        let len = shape
            .w
            .checked_mul(shape.h)
            .and_then(|n| n.checked_mul(shape.d))
            .ok_or_else(|| Error::Checkpoint(format!("`{name}` has an overflowing shape")))?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::Allocation { len })?;
        let mut buf = [0u8; 4];
        for _ in 0..len {
            file.read_exact(&mut buf)?;
            data.push(f32::from_le_bytes(buf));
        }
        entries.push(SnapshotEntry { name, shape, data });
    }
    Ok(entries)
}

/// Copies snapshot values into the matching parameters of `params`.
///
/// Entries without a matching parameter are ignored.
///
/// # Errors
/// Returns [`Error::UnnamedParameter`], [`Error::MissingParameter`] or
/// [`Error::ParameterShape`] if a parameter cannot be filled; nothing is
/// written in that case.
pub fn load_parameters(path: impl AsRef<Path>, params: &[Tensor]) -> Result<()> {
    let path = path.as_ref();
    let mut entries: HashMap<String, SnapshotEntry> = read_snapshot(path)?
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect();

    let mut matched = Vec::with_capacity(params.len());
    for param in params {
        let name = param.name().ok_or(Error::UnnamedParameter)?;
        let entry = entries
            .remove(name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))?;
        if entry.shape != param.shape() {
            return Err(Error::ParameterShape {
                name: name.to_string(),
                expected: param.shape(),
                found: entry.shape,
            });
        }
        matched.push((param, entry.data));
    }
    for (param, data) in &matched {
        param.set_values(data);
    }
    if !entries.is_empty() {
        log::debug!("{} snapshot entries were not requested", entries.len());
    }

    log::info!("loaded {} parameters from {}", matched.len(), path.display());
    Ok(())
}
