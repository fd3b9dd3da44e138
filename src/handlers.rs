//! Bundled payload handlers.
//!
//! The catalog ships one reference handler: NumPy `.npy` v1/v2 files under
//! the `"npy"` spec tag. Site-specific formats register their own handlers
//! through [`HandlerRegistry`](crate::filler::HandlerRegistry).

use std::path::{Path, PathBuf};

use memmap2::Mmap;
use ndarray::{ArrayD, Axis, IxDyn};
use serde_json::Value;

use crate::array::{parse_dtype_str, ColumnData, Dtype};
use crate::error::{CatalogError, CatalogResult};
use crate::filler::{Handler, HandlerFactory};
use crate::documents::JsonMap;

/// Factory for [`NpyHandler`], registered under spec `"npy"`.
#[derive(Debug, Default)]
pub struct NpyFactory;

impl HandlerFactory for NpyFactory {
    fn construct(
        &self,
        resource_path: &str,
        root: &str,
        _resource_kwargs: &JsonMap,
    ) -> CatalogResult<Box<dyn Handler>> {
        let path = Path::new(root).join(resource_path);
        Ok(Box::new(NpyHandler::open(&path)?))
    }
}

/// Reads a whole `.npy` array at construction; `read` serves the full array
/// or, with an integer `index` kwarg, one frame along the leading axis.
pub struct NpyHandler {
    path: PathBuf,
    data: ColumnData,
}

impl NpyHandler {
    pub fn open(path: &Path) -> CatalogResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| CatalogError::Handler {
            spec: "npy".into(),
            message: format!("cannot open {}: {e}", path.display()),
        })?;
        // SAFETY: the file is opened read-only and catalog data files are
        // immutable once written.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| CatalogError::Handler {
            spec: "npy".into(),
            message: format!("cannot map {}: {e}", path.display()),
        })?;
        let data = parse_npy(&mmap).map_err(|message| CatalogError::Handler {
            spec: "npy".into(),
            message: format!("{}: {message}", path.display()),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Handler for NpyHandler {
    fn read(&self, datum_kwargs: &JsonMap) -> CatalogResult<ColumnData> {
        match datum_kwargs.get("index").and_then(Value::as_u64) {
            None => Ok(self.data.clone()),
            Some(index) => select_frame(&self.data, index as usize).ok_or_else(|| {
                CatalogError::Handler {
                    spec: "npy".into(),
                    message: format!(
                        "index {index} out of bounds for {} with shape {:?}",
                        self.path.display(),
                        self.data.shape()
                    ),
                }
            }),
        }
    }
}

/// One frame along the leading axis, with that axis removed.
fn select_frame(column: &ColumnData, index: usize) -> Option<ColumnData> {
    fn pick<T: Clone>(arr: &ArrayD<T>, index: usize) -> Option<ArrayD<T>> {
        if arr.ndim() == 0 || index >= arr.shape()[0] {
            return None;
        }
        Some(arr.index_axis(Axis(0), index).to_owned())
    }
    match column {
        ColumnData::Bool(arr) => pick(arr, index).map(ColumnData::Bool),
        ColumnData::Int(arr) => pick(arr, index).map(ColumnData::Int),
        ColumnData::Float(arr) => pick(arr, index).map(ColumnData::Float),
        ColumnData::Str(arr) => pick(arr, index).map(ColumnData::Str),
        ColumnData::Record(arr) => pick(arr, index).map(ColumnData::Record),
    }
}

/// Minimal `.npy` decoder: v1/v2 headers, C order, little-endian bool,
/// integer, and float element types.
fn parse_npy(bytes: &[u8]) -> Result<ColumnData, String> {
    const MAGIC: &[u8] = b"\x93NUMPY";
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err("not an npy file".into());
    }
    let major = bytes[6];
    let (header_start, header_len) = match major {
        1 => (10usize, u16::from_le_bytes([bytes[8], bytes[9]]) as usize),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err("truncated npy header".into());
            }
            (
                12usize,
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            )
        }
        other => return Err(format!("unsupported npy version {other}")),
    };
    let header_end = header_start
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or("truncated npy header")?;
    let header = std::str::from_utf8(&bytes[header_start..header_end])
        .map_err(|_| "npy header is not ascii".to_string())?;

    let descr = header_str_field(header, "descr").ok_or("npy header lacks descr")?;
    if header_bool_field(header, "fortran_order").unwrap_or(false) {
        return Err("fortran-order npy arrays are not supported".into());
    }
    let shape = header_shape_field(header).ok_or("npy header lacks shape")?;

    let dtype = parse_dtype_str(&descr).ok_or_else(|| format!("unsupported descr '{descr}'"))?;
    let width: usize = descr
        .trim_start_matches(['<', '>', '|', '='])
        .chars()
        .skip(1)
        .collect::<String>()
        .parse()
        .unwrap_or(1);
    if descr.contains('>') && width > 1 {
        return Err("big-endian npy arrays are not supported".into());
    }

    let count: usize = shape.iter().product();
    let payload = &bytes[header_end..];
    let needed = count * width;
    if payload.len() < needed {
        return Err(format!(
            "payload too short: need {needed} bytes, have {}",
            payload.len()
        ));
    }

    let shape = IxDyn(&shape);
    match dtype {
        Dtype::Bool => {
            let values: Vec<bool> = payload[..count].iter().map(|&b| b != 0).collect();
            ArrayD::from_shape_vec(shape, values)
                .map(ColumnData::Bool)
                .map_err(|e| e.to_string())
        }
        Dtype::Int64 => {
            let values = read_ints(payload, count, width)?;
            ArrayD::from_shape_vec(shape, values)
                .map(ColumnData::Int)
                .map_err(|e| e.to_string())
        }
        Dtype::Float64 => {
            let values = read_floats(payload, count, width)?;
            ArrayD::from_shape_vec(shape, values)
                .map(ColumnData::Float)
                .map_err(|e| e.to_string())
        }
        Dtype::Str(_) | Dtype::Struct(_) => {
            Err(format!("unsupported npy element type '{descr}'"))
        }
    }
}

fn read_ints(payload: &[u8], count: usize, width: usize) -> Result<Vec<i64>, String> {
    let mut out = Vec::with_capacity(count);
    for chunk in payload[..count * width].chunks_exact(width) {
        let value = match width {
            1 => chunk[0] as i8 as i64,
            2 => i16::from_le_bytes([chunk[0], chunk[1]]) as i64,
            4 => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64,
            8 => i64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]),
            other => return Err(format!("unsupported integer width {other}")),
        };
        out.push(value);
    }
    Ok(out)
}

fn read_floats(payload: &[u8], count: usize, width: usize) -> Result<Vec<f64>, String> {
    let mut out = Vec::with_capacity(count);
    for chunk in payload[..count * width].chunks_exact(width) {
        let value = match width {
            4 => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            8 => f64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]),
            other => return Err(format!("unsupported float width {other}")),
        };
        out.push(value);
    }
    Ok(out)
}

fn header_str_field(header: &str, name: &str) -> Option<String> {
    let start = header.find(&format!("'{name}'"))?;
    let rest = &header[start..];
    let colon = rest.find(':')?;
    let rest = rest[colon + 1..].trim_start();
    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let end = rest[1..].find(quote)?;
    Some(rest[1..1 + end].to_string())
}

fn header_bool_field(header: &str, name: &str) -> Option<bool> {
    let start = header.find(&format!("'{name}'"))?;
    let rest = &header[start..];
    let colon = rest.find(':')?;
    let rest = rest[colon + 1..].trim_start();
    if rest.starts_with("True") {
        Some(true)
    } else if rest.starts_with("False") {
        Some(false)
    } else {
        None
    }
}

fn header_shape_field(header: &str) -> Option<Vec<usize>> {
    let start = header.find("'shape'")?;
    let rest = &header[start..];
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let inner = &rest[open + 1..close];
    let mut shape = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        shape.push(part.parse().ok()?);
    }
    Some(shape)
}

/// Serialize a float array into `.npy` v1 bytes. Test and tooling helper.
pub fn write_npy_f64(path: &Path, shape: &[usize], values: &[f64]) -> std::io::Result<()> {
    let shape_repr = match shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", shape[0]),
        _ => format!(
            "({})",
            shape.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {shape_repr}, }}"
    );
    // Pad so the payload starts 64-byte aligned, newline-terminated.
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat(unpadded.div_ceil(64) * 64 - unpadded));
    header.push('\n');

    let mut bytes = Vec::with_capacity(10 + header.len() + values.len() * 8);
    bytes.extend_from_slice(b"\x93NUMPY");
    bytes.push(1);
    bytes.push(0);
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npy_round_trip_f64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ones.npy");
        write_npy_f64(&path, &[5, 5], &[1.0; 25]).unwrap();

        let handler = NpyHandler::open(&path).unwrap();
        let column = handler.read(&JsonMap::new()).unwrap();
        assert_eq!(column.shape(), &[5, 5]);
        assert_eq!(column.float_at(&[4, 4]), Some(1.0));
    }

    #[test]
    fn npy_frame_indexing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.npy");
        let values: Vec<f64> = (0..12).map(f64::from).collect();
        write_npy_f64(&path, &[3, 2, 2], &values).unwrap();

        let handler = NpyHandler::open(&path).unwrap();
        let mut kwargs = JsonMap::new();
        kwargs.insert("index".into(), serde_json::json!(1));
        let frame = handler.read(&kwargs).unwrap();
        assert_eq!(frame.shape(), &[2, 2]);
        assert_eq!(frame.float_at(&[0, 0]), Some(4.0));

        kwargs.insert("index".into(), serde_json::json!(9));
        assert!(handler.read(&kwargs).is_err());
    }

    #[test]
    fn factory_joins_root_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        write_npy_f64(&path, &[2], &[7.0, 8.0]).unwrap();

        let handler = NpyFactory
            .construct("a.npy", dir.path().to_str().unwrap(), &JsonMap::new())
            .unwrap();
        let column = handler.read(&JsonMap::new()).unwrap();
        assert_eq!(column.float_at(&[1]), Some(8.0));
    }

    #[test]
    fn rejects_non_npy_bytes() {
        assert!(parse_npy(b"PK\x03\x04 definitely a zip").is_err());
    }

    #[test]
    fn rejects_fortran_order() {
        let header = "{'descr': '<f8', 'fortran_order': True, 'shape': (2, 2), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY");
        bytes.push(1);
        bytes.push(0);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(parse_npy(&bytes).is_err());
    }
}
