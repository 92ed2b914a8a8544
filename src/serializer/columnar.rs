//! Columnar Serializer
//!
//! Column-major encoding for table-shaped values: a sequence of mapping
//! rows that all share one key set, with each column homogeneous in
//! `Int`, `Float`, `Bool`, or `Str`. Numeric columns are packed as raw
//! little-endian arrays, so large tables decode without per-cell parsing.
//! Scalar and ragged inputs are rejected loudly.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! layout_version(1) || n_rows(4) || n_cols(2) ||
//!   [name_len(2) || name || dtype(1)] * n_cols ||
//!   column data * n_cols
//! ```
//!
//! String columns store `n_rows` lengths followed by the concatenated
//! UTF-8 bytes.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::Value;

use super::{SerializedPayload, Serializer};

const LAYOUT_VERSION: u8 = 1;

const DTYPE_I64: u8 = 0;
const DTYPE_F64: u8 = 1;
const DTYPE_BOOL: u8 = 2;
const DTYPE_STR: u8 = 3;

/// Column-major codec for table-shaped values.
#[derive(Debug, Clone, Default)]
pub struct ColumnarSerializer;

impl ColumnarSerializer {
    pub fn new() -> Self {
        Self
    }
}

enum Column {
    I64(Vec<i64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl Column {
    fn dtype(&self) -> u8 {
        match self {
            Column::I64(_) => DTYPE_I64,
            Column::F64(_) => DTYPE_F64,
            Column::Bool(_) => DTYPE_BOOL,
            Column::Str(_) => DTYPE_STR,
        }
    }

    fn push(&mut self, name: &str, row: usize, value: &Value) -> Result<()> {
        match (self, value) {
            (Column::I64(col), Value::Int(v)) => col.push(*v),
            (Column::F64(col), Value::Float(v)) => col.push(*v),
            (Column::Bool(col), Value::Bool(v)) => col.push(*v),
            (Column::Str(col), Value::Str(v)) => col.push(v.clone()),
            (col, other) => {
                return Err(unsupported(format!(
                    "column '{name}' row {row}: expected {}, found {}",
                    dtype_name(col.dtype()),
                    other.type_name()
                )))
            }
        }
        Ok(())
    }
}

fn dtype_name(dtype: u8) -> &'static str {
    match dtype {
        DTYPE_I64 => "int",
        DTYPE_F64 => "float",
        DTYPE_BOOL => "bool",
        DTYPE_STR => "str",
        _ => "unknown",
    }
}

fn unsupported(reason: String) -> Error {
    Error::UnsupportedValue {
        serializer: "columnar",
        reason,
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Serialization {
        serializer: "columnar",
        reason: reason.into(),
    }
}

impl Serializer for ColumnarSerializer {
    fn format_tag(&self) -> &'static str {
        "columnar"
    }

    fn code(&self) -> char {
        'c'
    }

    fn serialize(&self, value: &Value) -> Result<SerializedPayload> {
        let rows = match value {
            Value::Seq(rows) if !rows.is_empty() => rows,
            Value::Seq(_) => {
                return Err(unsupported(
                    "empty table has no schema; cache the empty marker with the msgpack serializer"
                        .into(),
                ))
            }
            other => {
                return Err(unsupported(format!(
                    "expected a sequence of mapping rows, found {}",
                    other.type_name()
                )))
            }
        };

        // Schema comes from the first row; every later row must match it.
        let first = match &rows[0] {
            Value::Map(m) => m,
            other => {
                return Err(unsupported(format!(
                    "row 0 is {}, expected a mapping",
                    other.type_name()
                )))
            }
        };

        let mut names: Vec<&String> = first.keys().collect();
        names.sort();
        let mut columns: Vec<Column> = Vec::with_capacity(names.len());
        for name in &names {
            let col = match &first[*name] {
                Value::Int(_) => Column::I64(Vec::with_capacity(rows.len())),
                Value::Float(_) => Column::F64(Vec::with_capacity(rows.len())),
                Value::Bool(_) => Column::Bool(Vec::with_capacity(rows.len())),
                Value::Str(_) => Column::Str(Vec::with_capacity(rows.len())),
                other => {
                    return Err(unsupported(format!(
                        "column '{name}' has unsupported cell type {}",
                        other.type_name()
                    )))
                }
            };
            columns.push(col);
        }

        for (row_idx, row) in rows.iter().enumerate() {
            let map = match row {
                Value::Map(m) => m,
                other => {
                    return Err(unsupported(format!(
                        "row {row_idx} is {}, expected a mapping",
                        other.type_name()
                    )))
                }
            };
            if map.len() != names.len() {
                return Err(unsupported(format!(
                    "row {row_idx} has {} columns, schema has {}",
                    map.len(),
                    names.len()
                )));
            }
            for (name, col) in names.iter().zip(columns.iter_mut()) {
                let cell = map
                    .get(*name)
                    .ok_or_else(|| unsupported(format!("row {row_idx} missing column '{name}'")))?;
                col.push(name, row_idx, cell)?;
            }
        }

        let mut out = Vec::with_capacity(16 + rows.len() * names.len() * 8);
        out.push(LAYOUT_VERSION);
        out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
        out.extend_from_slice(&(names.len() as u16).to_le_bytes());
        for (name, col) in names.iter().zip(columns.iter()) {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(col.dtype());
        }
        for col in &columns {
            match col {
                Column::I64(values) => {
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                Column::F64(values) => {
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                Column::Bool(values) => {
                    out.extend(values.iter().map(|&b| b as u8));
                }
                Column::Str(values) => {
                    for v in values {
                        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    }
                    for v in values {
                        out.extend_from_slice(v.as_bytes());
                    }
                }
            }
        }

        Ok(SerializedPayload {
            bytes: out.into(),
            compressible: true,
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        let mut r = Reader::new(bytes);

        let version = r.u8()?;
        if version != LAYOUT_VERSION {
            return Err(malformed(format!("unknown columnar layout {version}")));
        }
        let n_rows = r.u32()? as usize;
        let n_cols = r.u16()? as usize;

        let mut schema = Vec::with_capacity(n_cols);
        for _ in 0..n_cols {
            let name_len = r.u16()? as usize;
            let name = std::str::from_utf8(r.bytes(name_len)?)
                .map_err(|_| malformed("column name is not UTF-8"))?
                .to_string();
            let dtype = r.u8()?;
            schema.push((name, dtype));
        }

        let mut rows: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new(); n_rows];
        for (name, dtype) in &schema {
            match *dtype {
                DTYPE_I64 => {
                    for row in rows.iter_mut() {
                        row.insert(name.clone(), Value::Int(i64::from_le_bytes(r.array()?)));
                    }
                }
                DTYPE_F64 => {
                    for row in rows.iter_mut() {
                        row.insert(name.clone(), Value::Float(f64::from_le_bytes(r.array()?)));
                    }
                }
                DTYPE_BOOL => {
                    for row in rows.iter_mut() {
                        row.insert(name.clone(), Value::Bool(r.u8()? != 0));
                    }
                }
                DTYPE_STR => {
                    let mut lens = Vec::with_capacity(n_rows);
                    for _ in 0..n_rows {
                        lens.push(r.u32()? as usize);
                    }
                    for (row, len) in rows.iter_mut().zip(lens) {
                        let s = std::str::from_utf8(r.bytes(len)?)
                            .map_err(|_| malformed("string cell is not UTF-8"))?;
                        row.insert(name.clone(), Value::Str(s.to_string()));
                    }
                }
                other => return Err(malformed(format!("unknown column dtype {other}"))),
            }
        }

        Ok(Value::Seq(rows.into_iter().map(Value::Map).collect()))
    }
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("truncated columnar payload"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.bytes(N)?);
        Ok(arr)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

// =============================================================================
// Tests
// =============================================================================
