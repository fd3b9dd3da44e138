//! Typed n-dimensional column data.
//!
//! Materialized columns are dense `ndarray` arrays tagged with an element
//! type ([`Dtype`]) and labeled dimensions ([`DataArray`]). The module owns
//! the conversions between stored JSON cell values and typed rows, including
//! the declared-dtype coercion rule: a mismatch between declared and actual
//! data warns (with run-uid context) and casts in place, never fails.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde_json::Value;
use tracing::warn;

use crate::error::{CatalogError, CatalogResult};

/// One field of a rank-1 structured dtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub dtype: Dtype,
}

/// Element type of a materialized column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dtype {
    Bool,
    Int64,
    Float64,
    /// Fixed-width string; width 0 means "unknown, scan the column".
    Str(usize),
    /// Rank-1 structured records.
    Struct(Vec<StructField>),
}

impl Dtype {
    /// Bytes per element, matching NumPy conventions (UCS-4 strings).
    pub fn itemsize(&self) -> usize {
        match self {
            Dtype::Bool => 1,
            Dtype::Int64 | Dtype::Float64 => 8,
            Dtype::Str(width) => 4 * (*width).max(1),
            Dtype::Struct(fields) => fields.iter().map(|f| f.dtype.itemsize()).sum(),
        }
    }
}

/// Parse a NumPy-style type string (`<f8`, `|b1`, `<U10`, ...).
pub fn parse_dtype_str(spec: &str) -> Option<Dtype> {
    let body = spec
        .trim()
        .strip_prefix(['<', '>', '|', '='])
        .unwrap_or_else(|| spec.trim());
    match body {
        "b1" | "?" => Some(Dtype::Bool),
        "i1" | "i2" | "i4" | "i8" | "u1" | "u2" | "u4" | "u8" => Some(Dtype::Int64),
        "f2" | "f4" | "f8" => Some(Dtype::Float64),
        _ => {
            let (code, width) = body.split_at(1.min(body.len()));
            if matches!(code, "U" | "S" | "a") {
                width.parse().ok().map(Dtype::Str)
            } else {
                None
            }
        }
    }
}

/// Build a structured dtype from a descriptor's `dtype_descr` pairs.
///
/// Only rank-1 structures are supported; a nested description (a list where a
/// type string should be) is `UnsupportedDtype`.
pub fn dtype_from_descr(key: &str, descr: &[(String, Value)]) -> CatalogResult<Dtype> {
    let mut fields = Vec::with_capacity(descr.len());
    for (name, spec) in descr {
        let spec = match spec {
            Value::String(s) => s.as_str(),
            Value::Array(_) => {
                return Err(CatalogError::UnsupportedDtype {
                    key: key.to_string(),
                    reason: format!("field '{name}' nests a structured dtype"),
                })
            }
            other => {
                return Err(CatalogError::UnsupportedDtype {
                    key: key.to_string(),
                    reason: format!("field '{name}' has non-string type {other}"),
                })
            }
        };
        let dtype = parse_dtype_str(spec).ok_or_else(|| CatalogError::UnsupportedDtype {
            key: key.to_string(),
            reason: format!("field '{name}' has unparseable type '{spec}'"),
        })?;
        fields.push(StructField {
            name: name.clone(),
            dtype,
        });
    }
    Ok(Dtype::Struct(fields))
}

/// Dense column values, one variant per element family.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(ArrayD<bool>),
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
    Str(ArrayD<String>),
    /// Structured records, kept as JSON objects.
    Record(ArrayD<Value>),
}

macro_rules! each_family {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            ColumnData::Bool($arr) => $body,
            ColumnData::Int($arr) => $body,
            ColumnData::Float($arr) => $body,
            ColumnData::Str($arr) => $body,
            ColumnData::Record($arr) => $body,
        }
    };
}

impl ColumnData {
    pub fn shape(&self) -> &[usize] {
        each_family!(self, arr => arr.shape())
    }

    pub fn ndim(&self) -> usize {
        each_family!(self, arr => arr.ndim())
    }

    /// Length along the leading axis; 1 for rank-0 scalars.
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restrict every axis to a half-open bound.
    pub fn slice_axes(&self, bounds: &[(usize, usize)]) -> ColumnData {
        fn cut<T: Clone>(arr: &ArrayD<T>, bounds: &[(usize, usize)]) -> ArrayD<T> {
            let mut view = arr.view();
            for (axis, (start, end)) in bounds.iter().enumerate() {
                view.slice_axis_inplace(Axis(axis), Slice::from(*start..*end));
            }
            view.to_owned()
        }
        match self {
            ColumnData::Bool(arr) => ColumnData::Bool(cut(arr, bounds)),
            ColumnData::Int(arr) => ColumnData::Int(cut(arr, bounds)),
            ColumnData::Float(arr) => ColumnData::Float(cut(arr, bounds)),
            ColumnData::Str(arr) => ColumnData::Str(cut(arr, bounds)),
            ColumnData::Record(arr) => ColumnData::Record(cut(arr, bounds)),
        }
    }

    /// Concatenate same-family parts along an existing axis.
    pub fn concat(parts: &[ColumnData], axis: usize) -> CatalogResult<ColumnData> {
        fn join<T: Clone>(
            parts: Vec<&ArrayD<T>>,
            axis: usize,
        ) -> Result<ArrayD<T>, ndarray::ShapeError> {
            let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
            ndarray::concatenate(Axis(axis), &views)
        }
        let mismatch = || CatalogError::BadShapeMetadata {
            key: "<concat>".into(),
            declared: vec![],
            actual: vec![],
        };
        match parts.first().ok_or_else(mismatch)? {
            ColumnData::Bool(_) => {
                let arrs: Option<Vec<_>> = parts
                    .iter()
                    .map(|p| match p {
                        ColumnData::Bool(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                Ok(ColumnData::Bool(
                    join(arrs.ok_or_else(mismatch)?, axis).map_err(|_| mismatch())?,
                ))
            }
            ColumnData::Int(_) => {
                let arrs: Option<Vec<_>> = parts
                    .iter()
                    .map(|p| match p {
                        ColumnData::Int(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                Ok(ColumnData::Int(
                    join(arrs.ok_or_else(mismatch)?, axis).map_err(|_| mismatch())?,
                ))
            }
            ColumnData::Float(_) => {
                let arrs: Option<Vec<_>> = parts
                    .iter()
                    .map(|p| match p {
                        ColumnData::Float(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                Ok(ColumnData::Float(
                    join(arrs.ok_or_else(mismatch)?, axis).map_err(|_| mismatch())?,
                ))
            }
            ColumnData::Str(_) => {
                let arrs: Option<Vec<_>> = parts
                    .iter()
                    .map(|p| match p {
                        ColumnData::Str(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                Ok(ColumnData::Str(
                    join(arrs.ok_or_else(mismatch)?, axis).map_err(|_| mismatch())?,
                ))
            }
            ColumnData::Record(_) => {
                let arrs: Option<Vec<_>> = parts
                    .iter()
                    .map(|p| match p {
                        ColumnData::Record(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                Ok(ColumnData::Record(
                    join(arrs.ok_or_else(mismatch)?, axis).map_err(|_| mismatch())?,
                ))
            }
        }
    }

    /// Nested-list JSON rendering (used when filling events in place).
    pub fn to_value(&self) -> Value {
        fn render<T, F: Fn(&T) -> Value + Copy>(arr: &ndarray::ArrayViewD<'_, T>, leaf: F) -> Value {
            if arr.ndim() == 0 {
                arr.iter().next().map(leaf).unwrap_or(Value::Null)
            } else {
                Value::Array(arr.axis_iter(Axis(0)).map(|sub| render(&sub, leaf)).collect())
            }
        }
        match self {
            ColumnData::Bool(arr) => render(&arr.view(), |b| Value::Bool(*b)),
            ColumnData::Int(arr) => render(&arr.view(), |i| Value::from(*i)),
            ColumnData::Float(arr) => {
                render(&arr.view(), |f| {
                    serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
                })
            }
            ColumnData::Str(arr) => render(&arr.view(), |s: &String| Value::String(s.clone())),
            ColumnData::Record(arr) => render(&arr.view(), |v: &Value| v.clone()),
        }
    }

    pub fn float_at(&self, index: &[usize]) -> Option<f64> {
        match self {
            ColumnData::Float(arr) => arr.get(IxDyn(index)).copied(),
            ColumnData::Int(arr) => arr.get(IxDyn(index)).map(|&i| i as f64),
            ColumnData::Bool(arr) => arr.get(IxDyn(index)).map(|&b| b as u8 as f64),
            _ => None,
        }
    }

    pub fn int_at(&self, index: &[usize]) -> Option<i64> {
        match self {
            ColumnData::Int(arr) => arr.get(IxDyn(index)).copied(),
            ColumnData::Float(arr) => arr.get(IxDyn(index)).map(|&f| f as i64),
            ColumnData::Bool(arr) => arr.get(IxDyn(index)).map(|&b| b as i64),
            _ => None,
        }
    }

    pub fn str_at(&self, index: &[usize]) -> Option<&str> {
        match self {
            ColumnData::Str(arr) => arr.get(IxDyn(index)).map(String::as_str),
            _ => None,
        }
    }

    pub fn bool_at(&self, index: &[usize]) -> Option<bool> {
        match self {
            ColumnData::Bool(arr) => arr.get(IxDyn(index)).copied(),
            _ => None,
        }
    }

    /// Widest string in a string column, in characters.
    pub fn max_str_width(&self) -> usize {
        match self {
            ColumnData::Str(arr) => arr.iter().map(|s| s.chars().count()).max().unwrap_or(0),
            _ => 0,
        }
    }
}

/// One materialized column with labeled dimensions and attributes.
#[derive(Debug, Clone)]
pub struct DataArray {
    pub dims: Vec<String>,
    pub dtype: Dtype,
    pub values: ColumnData,
    /// Producing device, from the descriptor's `object_keys`.
    pub object: Option<String>,
    pub units: Option<String>,
}

/// A materialized stream view: a shared `time` coordinate plus one
/// [`DataArray`] per column.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub time: Vec<f64>,
    pub arrays: BTreeMap<String, DataArray>,
}

impl Dataset {
    /// Row count (the `time` dimension length).
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&DataArray> {
        self.arrays.get(key)
    }
}

/// One event's worth of raw column input.
#[derive(Debug, Clone)]
pub enum RowValue {
    /// Inline JSON cell from the event document.
    Json(Value),
    /// Already-materialized payload from the external filler.
    Array(ColumnData),
    /// The event lacks this column; backfill with the dtype's neutral value.
    Missing,
}

/// Validate one row against the declared per-row shape.
///
/// Equal shapes pass through. A rank mismatch fails. Axis deficits up to 2
/// are repaired: positive deficits pad the trailing edge by edge-replication,
/// negative deficits trim. Anything larger is `BadShapeMetadata`.
pub fn validate_shape<T: Clone>(
    key: &str,
    mut arr: ArrayD<T>,
    expected: &[usize],
) -> CatalogResult<ArrayD<T>> {
    let actual = arr.shape().to_vec();
    if actual == expected {
        return Ok(arr);
    }
    let bad = || CatalogError::BadShapeMetadata {
        key: key.to_string(),
        declared: expected.to_vec(),
        actual: actual.clone(),
    };
    if actual.len() != expected.len() {
        return Err(bad());
    }
    for axis in 0..expected.len() {
        let current = arr.shape()[axis];
        let target = expected[axis];
        if current == target {
            continue;
        }
        let deficit = target as i64 - current as i64;
        if deficit.abs() > 2 || current == 0 {
            return Err(bad());
        }
        if deficit > 0 {
            let edge = arr
                .slice_axis(Axis(axis), Slice::from(current - 1..current))
                .to_owned();
            let mut parts = vec![arr.view()];
            for _ in 0..deficit {
                parts.push(edge.view());
            }
            arr = ndarray::concatenate(Axis(axis), &parts).map_err(|_| bad())?;
        } else {
            arr = arr.slice_axis(Axis(axis), Slice::from(0..target)).to_owned();
        }
    }
    Ok(arr)
}

/// Stack per-event rows into one column array of shape `(rows, *declared)`.
///
/// Every row is coerced to `dtype` (mismatches warn once per column and
/// cast), validated/repaired against `declared`, and missing rows are filled
/// with the dtype's neutral element.
pub fn stack_rows(
    key: &str,
    run_uid: &str,
    dtype: &Dtype,
    declared: &[usize],
    rows: Vec<RowValue>,
) -> CatalogResult<ColumnData> {
    let mut mismatched = false;
    let result = match dtype {
        Dtype::Float64 => {
            let parsed = parse_all(key, declared, rows, &mut mismatched, json_to_f64, |cd| {
                cast_to_f64(cd)
            })?;
            ColumnData::Float(stack(key, declared, parsed)?)
        }
        Dtype::Int64 => {
            let parsed = parse_all(key, declared, rows, &mut mismatched, json_to_i64, |cd| {
                cast_to_i64(cd)
            })?;
            ColumnData::Int(stack(key, declared, parsed)?)
        }
        Dtype::Bool => {
            let parsed = parse_all(key, declared, rows, &mut mismatched, json_to_bool, |cd| {
                cast_to_bool(cd)
            })?;
            ColumnData::Bool(stack(key, declared, parsed)?)
        }
        Dtype::Str(_) => {
            let parsed = parse_all(key, declared, rows, &mut mismatched, json_to_string, |cd| {
                cast_to_string(cd)
            })?;
            ColumnData::Str(stack(key, declared, parsed)?)
        }
        Dtype::Struct(_) => {
            let parsed = parse_all(key, declared, rows, &mut mismatched, json_to_record, |cd| {
                (record_from_column(cd), false)
            })?;
            ColumnData::Record(stack(key, declared, parsed)?)
        }
    };
    if mismatched {
        warn!(
            run_uid,
            key, "stored values did not match the declared dtype; cast in place"
        );
    }
    Ok(result)
}

type Scalar<T> = fn(&Value) -> (Option<T>, bool);

fn parse_all<T: Clone + Default>(
    key: &str,
    declared: &[usize],
    rows: Vec<RowValue>,
    mismatched: &mut bool,
    scalar: Scalar<T>,
    from_column: impl Fn(ColumnData) -> (ArrayD<T>, bool),
) -> CatalogResult<Vec<ArrayD<T>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = match row {
            RowValue::Missing => neutral::<T>(declared, scalar),
            RowValue::Json(value) => {
                let arr = json_to_array(key, &value, declared, scalar, mismatched)?;
                validate_shape(key, arr, declared)?
            }
            RowValue::Array(column) => {
                let (arr, cast) = from_column(column);
                *mismatched |= cast;
                validate_shape(key, arr, declared)?
            }
        };
        out.push(arr);
    }
    Ok(out)
}

fn neutral<T: Clone + Default>(declared: &[usize], scalar: Scalar<T>) -> ArrayD<T> {
    let fill = scalar(&Value::Null).0.unwrap_or_default();
    ArrayD::from_elem(IxDyn(declared), fill)
}

/// Parse one JSON cell into a typed array, inferring nesting up to the
/// declared rank.
fn json_to_array<T: Clone + Default>(
    key: &str,
    value: &Value,
    declared: &[usize],
    scalar: Scalar<T>,
    mismatched: &mut bool,
) -> CatalogResult<ArrayD<T>> {
    fn walk<T>(
        value: &Value,
        depth: usize,
        max_depth: usize,
        shape: &mut Vec<usize>,
        out: &mut Vec<T>,
        scalar: Scalar<T>,
        mismatched: &mut bool,
    ) -> Result<(), Vec<usize>> {
        match value {
            Value::Array(items) if depth < max_depth => {
                if shape.len() == depth {
                    shape.push(items.len());
                } else if shape[depth] != items.len() {
                    return Err(shape.clone());
                }
                for item in items {
                    walk(item, depth + 1, max_depth, shape, out, scalar, mismatched)?;
                }
                Ok(())
            }
            leaf => {
                if depth != max_depth {
                    return Err(shape.clone());
                }
                let (parsed, cast) = scalar(leaf);
                *mismatched |= cast;
                match parsed {
                    Some(v) => out.push(v),
                    None => return Err(shape.clone()),
                }
                Ok(())
            }
        }
    }

    // Ranks may legitimately disagree within the pad/trim tolerance, so the
    // observed nesting depth wins over the declared rank.
    let mut observed = 0usize;
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        observed += 1;
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    let mut shape = Vec::new();
    let mut flat = Vec::new();
    walk(value, 0, observed, &mut shape, &mut flat, scalar, mismatched).map_err(|partial| {
        CatalogError::BadShapeMetadata {
            key: key.to_string(),
            declared: declared.to_vec(),
            actual: partial,
        }
    })?;
    ArrayD::from_shape_vec(IxDyn(&shape), flat).map_err(|_| CatalogError::BadShapeMetadata {
        key: key.to_string(),
        declared: declared.to_vec(),
        actual: shape,
    })
}

fn stack<T: Clone>(
    key: &str,
    declared: &[usize],
    rows: Vec<ArrayD<T>>,
) -> CatalogResult<ArrayD<T>> {
    if rows.is_empty() {
        let mut shape = vec![0];
        shape.extend_from_slice(declared);
        return ArrayD::from_shape_vec(IxDyn(&shape), Vec::new()).map_err(|_| {
            CatalogError::BadShapeMetadata {
                key: key.to_string(),
                declared: declared.to_vec(),
                actual: vec![],
            }
        });
    }
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|_| CatalogError::BadShapeMetadata {
        key: key.to_string(),
        declared: declared.to_vec(),
        actual: rows
            .first()
            .map(|r| r.shape().to_vec())
            .unwrap_or_default(),
    })
}

// --- scalar parsers: (parsed value, mismatch-cast flag) ---

fn json_to_f64(value: &Value) -> (Option<f64>, bool) {
    match value {
        Value::Number(n) => (Some(n.as_f64().unwrap_or(f64::NAN)), false),
        Value::Null => (Some(f64::NAN), false),
        Value::Bool(b) => (Some(*b as u8 as f64), true),
        Value::String(s) => (Some(s.parse().unwrap_or(f64::NAN)), true),
        _ => (None, false),
    }
}

fn json_to_i64(value: &Value) -> (Option<i64>, bool) {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => (Some(i), false),
            None => (Some(n.as_f64().unwrap_or(0.0) as i64), true),
        },
        Value::Null => (Some(0), false),
        Value::Bool(b) => (Some(*b as i64), true),
        Value::String(s) => (Some(s.parse().unwrap_or(0)), true),
        _ => (None, false),
    }
}

fn json_to_bool(value: &Value) -> (Option<bool>, bool) {
    match value {
        Value::Bool(b) => (Some(*b), false),
        Value::Null => (Some(false), false),
        Value::Number(n) => (Some(n.as_f64().unwrap_or(0.0) != 0.0), true),
        _ => (None, false),
    }
}

fn json_to_string(value: &Value) -> (Option<String>, bool) {
    match value {
        Value::String(s) => (Some(s.clone()), false),
        Value::Null => (Some(String::new()), false),
        Value::Number(n) => (Some(n.to_string()), true),
        Value::Bool(b) => (Some(b.to_string()), true),
        _ => (None, false),
    }
}

fn json_to_record(value: &Value) -> (Option<Value>, bool) {
    match value {
        Value::Array(_) => (None, false),
        other => (Some(other.clone()), false),
    }
}

// --- filler-output casts to a declared family ---

fn cast_to_f64(column: ColumnData) -> (ArrayD<f64>, bool) {
    match column {
        ColumnData::Float(arr) => (arr, false),
        ColumnData::Int(arr) => (arr.mapv(|i| i as f64), true),
        ColumnData::Bool(arr) => (arr.mapv(|b| b as u8 as f64), true),
        ColumnData::Str(arr) => (arr.mapv(|s| s.parse().unwrap_or(f64::NAN)), true),
        ColumnData::Record(arr) => (arr.mapv(|_| f64::NAN), true),
    }
}

fn cast_to_i64(column: ColumnData) -> (ArrayD<i64>, bool) {
    match column {
        ColumnData::Int(arr) => (arr, false),
        ColumnData::Float(arr) => (arr.mapv(|f| f as i64), true),
        ColumnData::Bool(arr) => (arr.mapv(|b| b as i64), true),
        ColumnData::Str(arr) => (arr.mapv(|s| s.parse().unwrap_or(0)), true),
        ColumnData::Record(arr) => (arr.mapv(|_| 0), true),
    }
}

fn cast_to_bool(column: ColumnData) -> (ArrayD<bool>, bool) {
    match column {
        ColumnData::Bool(arr) => (arr, false),
        ColumnData::Int(arr) => (arr.mapv(|i| i != 0), true),
        ColumnData::Float(arr) => (arr.mapv(|f| f != 0.0), true),
        ColumnData::Str(arr) => (arr.mapv(|s| !s.is_empty()), true),
        ColumnData::Record(arr) => (arr.mapv(|_| false), true),
    }
}

fn cast_to_string(column: ColumnData) -> (ArrayD<String>, bool) {
    match column {
        ColumnData::Str(arr) => (arr, false),
        ColumnData::Int(arr) => (arr.mapv(|i| i.to_string()), true),
        ColumnData::Float(arr) => (arr.mapv(|f| f.to_string()), true),
        ColumnData::Bool(arr) => (arr.mapv(|b| b.to_string()), true),
        ColumnData::Record(arr) => (arr.mapv(|v| v.to_string()), true),
    }
}

fn record_from_column(column: ColumnData) -> ArrayD<Value> {
    match column {
        ColumnData::Record(arr) => arr,
        other => {
            let shape = other.shape().to_vec();
            let value = other.to_value();
            // Flattening back out of nested JSON keeps the row intact even if
            // a handler produced a numeric array for a structured column.
            let mut flat = Vec::new();
            fn collect(v: &Value, out: &mut Vec<Value>) {
                match v {
                    Value::Array(items) => items.iter().for_each(|i| collect(i, out)),
                    leaf => out.push(leaf.clone()),
                }
            }
            collect(&value, &mut flat);
            ArrayD::from_shape_vec(IxDyn(&shape), flat)
                .unwrap_or_else(|_| ArrayD::from_elem(IxDyn(&[]), Value::Null))
        }
    }
}
