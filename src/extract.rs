//! Recognizing the two object shapes NPIC files are made of: pickled
//! `numpy.ndarray` images and a flat metadata dict.
//!
//! Nothing in here is an error. If the object does not look like what we
//! want, you get `None` and can try the next thing.
//!
//! A pickled 256×256 `float32` image looks like this:
//!
//! ```plaintext
//! OBJECT(nitems=2)
//!     REDUCE(nitems=2)
//!         GLOBAL(nitems=2)
//!             STRING('numpy.core.multiarray')
//!             STRING('_reconstruct')
//!         SEQ(nitems=3)
//!             GLOBAL(nitems=2)
//!                 STRING('numpy')
//!                 STRING('ndarray')
//!             SEQ(nitems=1)
//!                 INT(0)
//!             BYTES(len=1)
//!     SEQ(nitems=5)
//!         INT(1)
//!         SEQ(nitems=2)
//!             INT(256)
//!             INT(256)
//!         OBJECT(nitems=2)
//!             REDUCE(nitems=2)
//!                 GLOBAL(nitems=2)
//!                     STRING('numpy')
//!                     STRING('dtype')
//!                 SEQ(nitems=3)
//!                     STRING('f4')
//!                     INT(0)
//!                     INT(1)
//!             SEQ(nitems=8)
//!                 INT(3)
//!                 STRING('<')
//!                 NONE
//!                 NONE
//!                 NONE
//!                 INT(-1)
//!                 INT(-1)
//!                 INT(0)
//!         BOOL(False)
//!         BYTES(len=262144)
//! ```

use std::collections::BTreeMap;

use log::debug;

use crate::value::{ObjectTag, View};

/// Largest accepted image dimension.
pub const MAX_DIMENSION: usize = 1 << 16;

/// Modules `_reconstruct` has lived in. NumPy 2 renamed `core` to `_core`.
const RECONSTRUCT_MODULES: [&str; 2] = ["numpy.core.multiarray", "numpy._core.multiarray"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float32,
    Float64,
}

impl DType {
    /// Parse a NumPy type code. Only the ones we can load are known.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "f4" => Some(Self::Float32),
            "f8" => Some(Self::Float64),
            _ => None,
        }
    }

    /// Item size in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// NumPy's byte order marker. `>` is big endian, everything else
    /// (`<`, `=`, `|`) we treat as little endian.
    pub fn from_marker(marker: &str) -> Self {
        if marker == ">" {
            Self::Big
        } else {
            Self::Little
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A two dimensional array recovered from a pickled `ndarray`.
pub struct NdArray {
    pub rows: usize,
    pub cols: usize,
    pub dtype: DType,
    pub byte_order: ByteOrder,
    /// Data is stored column by column.
    pub fortran_order: bool,
    /// Exactly `rows * cols * dtype.size()` bytes.
    pub raw: Vec<u8>,
}

impl NdArray {
    /// Convert the raw data to row-major `f64` values.
    pub fn values(&self) -> Vec<f64> {
        let size = self.dtype.size();
        let decoded = self
            .raw
            .chunks_exact(size)
            .map(|c| match (self.dtype, self.byte_order) {
                (DType::Float32, order) => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(c);
                    f64::from(match order {
                        ByteOrder::Little => f32::from_le_bytes(b),
                        ByteOrder::Big => f32::from_be_bytes(b),
                    })
                }
                (DType::Float64, order) => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    match order {
                        ByteOrder::Little => f64::from_le_bytes(b),
                        ByteOrder::Big => f64::from_be_bytes(b),
                    }
                }
            })
            .collect::<Vec<_>>();
        if !self.fortran_order {
            return decoded;
        }
        let (rows, cols) = (self.rows, self.cols);
        (0..rows * cols)
            .map(|i| decoded[(i % cols) * rows + i / cols])
            .collect()
    }
}

fn dimension(v: View<'_>) -> Option<usize> {
    usize::try_from(v.as_int()?)
        .ok()
        .filter(|d| (1..=MAX_DIMENSION).contains(d))
}

/// Try to interpret an object as a pickled two dimensional `ndarray`.
pub fn extract_array(root: View<'_>) -> Option<NdArray> {
    if !root.is(ObjectTag::Built) {
        return None;
    }

    let reduce = root.child(0, ObjectTag::Reduce)?;
    let reconstruct = reduce.child(0, ObjectTag::Global)?;
    if !RECONSTRUCT_MODULES
        .iter()
        .any(|m| reconstruct.is_global(m, "_reconstruct"))
    {
        return None;
    }
    let args = reduce.child(1, ObjectTag::Seq)?;
    if !args.child(0, ObjectTag::Global)?.is_global("numpy", "ndarray") {
        return None;
    }
    debug!("is numpy.ndarray");

    let state = root.child(1, ObjectTag::Seq)?;
    let shape = state.child(1, ObjectTag::Seq)?;
    if shape.len() != 2 {
        return None;
    }
    let rows = dimension(shape.child(0, ObjectTag::Int)?)?;
    let cols = dimension(shape.child(1, ObjectTag::Int)?)?;
    debug!("xres {cols}, yres {rows}");

    let descr = state.child(2, ObjectTag::Built)?;
    let dreduce = descr.child(0, ObjectTag::Reduce)?;
    if !dreduce.child(0, ObjectTag::Global)?.is_global("numpy", "dtype") {
        return None;
    }
    let code = dreduce
        .child(1, ObjectTag::Seq)?
        .child(0, ObjectTag::String)?
        .as_str()?;
    debug!("dtype {code}");
    let dtype = DType::from_code(code)?;
    let marker = descr
        .child(1, ObjectTag::Seq)?
        .child(1, ObjectTag::String)?
        .as_str()?;
    let byte_order = ByteOrder::from_marker(marker);
    let fortran_order = state
        .child(3, ObjectTag::Bool)
        .and_then(|b| b.as_bool())
        .unwrap_or(false);

    let raw = state.last_child(ObjectTag::Bytes)?.as_bytes()?;
    if Some(raw.len()) != rows.checked_mul(cols).and_then(|n| n.checked_mul(dtype.size())) {
        debug!(
            "{} bytes of data do not match {rows}x{cols} items of {dtype:?}",
            raw.len()
        );
        return None;
    }

    Some(NdArray {
        rows,
        cols,
        dtype,
        byte_order,
        fortran_order,
        raw: raw.to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq)]
/// Scan parameters from the metadata dict, plus everything in it as text.
pub struct Metadata {
    /// All scalar entries as display strings, with `FooUnit` merged into `Foo`.
    pub entries: BTreeMap<String, String>,
    pub x_step: f64,
    pub y_step: f64,
    pub x_cal: f64,
    pub y_cal: f64,
    pub z_cal: f64,
    pub x_cal_unit: Option<String>,
    pub z_cal_unit: Option<String>,
    pub channel_names: Vec<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            x_step: 1.0,
            y_step: 1.0,
            x_cal: 1.0,
            y_cal: 1.0,
            z_cal: 1.0,
            x_cal_unit: None,
            z_cal_unit: None,
            channel_names: Vec::new(),
        }
    }
}

/// Try to interpret an object as the metadata dict.
pub fn extract_metadata(root: View<'_>) -> Option<Metadata> {
    if !root.is(ObjectTag::Dict) {
        return None;
    }

    let mut meta = Metadata::default();
    for (k, v) in root.dict_items() {
        let Some(key) = k.as_str() else {
            continue;
        };
        let Some(tag) = v.tag() else {
            continue;
        };
        match tag {
            ObjectTag::String => {
                let s = v.as_str().unwrap_or_default();
                match key {
                    "XCalibrationUnit" => meta.x_cal_unit = Some(s.to_owned()),
                    "ZCalibrationUnit" => meta.z_cal_unit = Some(s.to_owned()),
                    _ => (),
                }
                meta.entries.insert(key.to_owned(), s.to_owned());
            }
            ObjectTag::Bool => {
                let b = if v.as_bool() == Some(true) { "True" } else { "False" };
                meta.entries.insert(key.to_owned(), b.to_owned());
            }
            ObjectTag::Int => {
                let i = v.as_int().unwrap_or_default();
                meta.entries.insert(key.to_owned(), i.to_string());
            }
            ObjectTag::Float => {
                let f = v.as_float().unwrap_or_default();
                match key {
                    "XCalibration" => meta.x_cal = f.abs(),
                    "YCalibration" => meta.y_cal = f.abs(),
                    "ZCalibration" => meta.z_cal = f.abs(),
                    _ => (),
                }
                meta.entries.insert(key.to_owned(), format_g(f));
            }
            ObjectTag::Seq => match key {
                "StepSize" if v.len() == 2 => {
                    let Some(x) = v.child(0, ObjectTag::Float).and_then(|c| c.as_float()) else {
                        continue;
                    };
                    meta.x_step = x;
                    let Some(y) = v.child(1, ObjectTag::Float).and_then(|c| c.as_float()) else {
                        continue;
                    };
                    meta.y_step = y;
                    meta.entries.insert("StepSizeX".to_owned(), format_g(x));
                    meta.entries.insert("StepSizeY".to_owned(), format_g(y));
                    debug!("steps {x}, {y}");
                }
                // The ndarray knows its own size better.
                "ImageSize" if v.len() == 2 => (),
                "ChannelNames" => {
                    for (i, name) in v.children().enumerate() {
                        if let Some(name) = name.as_str() {
                            debug!("channel[{i}] = {name}");
                            meta.channel_names.push(name.to_owned());
                            meta.entries.insert(format!("{key}[{i}]"), name.to_owned());
                        }
                    }
                }
                _ => debug!("unhandled sequence-like metadata {key}"),
            },
            other => debug!("unhandled metadata {key} of type {other}"),
        }
    }
    merge_units(&mut meta.entries);
    Some(meta)
}

/// Format like C's `%g`: six significant digits, exponent form for very
/// small or large magnitudes, no trailing zeros.
pub fn format_g(v: f64) -> String {
    const PRECISION: i32 = 6;
    if v.is_nan() {
        return "nan".to_owned();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }
    // Rounding to the precision can bump the exponent, so take it from there.
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, v);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp = exp.parse::<i32>().unwrap_or_default();
    if exp < -4 || exp >= PRECISION {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    } else {
        let fixed = format!("{:.*}", (PRECISION - 1 - exp) as usize, v);
        trim_fraction(&fixed).to_owned()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Fold `FooUnit` entries into `Foo` as `"value unit"` when `Foo` exists.
fn merge_units(entries: &mut BTreeMap<String, String>) {
    let unit_keys = entries
        .keys()
        .filter(|k| {
            k.strip_suffix("Unit")
                .is_some_and(|stem| entries.contains_key(stem))
        })
        .cloned()
        .collect::<Vec<_>>();
    for unit_key in unit_keys {
        let Some(unit) = entries.remove(&unit_key) else {
            continue;
        };
        let stem = &unit_key[..unit_key.len() - 4];
        if let Some(value) = entries.get_mut(stem) {
            value.push(' ');
            value.push_str(&unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_codes() {
        assert_eq!(DType::from_code("f4"), Some(DType::Float32));
        assert_eq!(DType::from_code("f8").map(DType::size), Some(8));
        assert_eq!(DType::from_code("i4"), None);
        assert_eq!(ByteOrder::from_marker(">"), ByteOrder::Big);
        assert_eq!(ByteOrder::from_marker("="), ByteOrder::Little);
    }

    #[test]
    fn values_respect_order() {
        let mut raw = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        let mut arr = NdArray {
            rows: 2,
            cols: 3,
            dtype: DType::Float32,
            byte_order: ByteOrder::Big,
            fortran_order: false,
            raw,
        };
        assert_eq!(arr.values(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        // Column-major: columns are (1, 2), (3, 4), (5, 6).
        arr.fortran_order = true;
        assert_eq!(arr.values(), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn c_style_floats() {
        assert_eq!(format_g(18.0), "18");
        assert_eq!(format_g(-146.1), "-146.1");
        assert_eq!(format_g(0.1 + 0.2), "0.3");
        assert_eq!(format_g(1e-9), "1e-09");
        assert_eq!(format_g(0.0001), "0.0001");
        assert_eq!(format_g(0.00001234), "1.234e-05");
        assert_eq!(format_g(100000.0), "100000");
        assert_eq!(format_g(1234567.0), "1.23457e+06");
        assert_eq!(format_g(999999.5), "1e+06");
        assert_eq!(format_g(0.0), "0");
    }

    #[test]
    fn unit_merging() {
        let mut entries = BTreeMap::new();
        entries.insert("XOffset".to_owned(), "-146.1".to_owned());
        entries.insert("XOffsetUnit".to_owned(), "nm".to_owned());
        entries.insert("ImageSizeUnit".to_owned(), "pixels".to_owned());
        merge_units(&mut entries);
        assert_eq!(entries.get("XOffset").map(String::as_str), Some("-146.1 nm"));
        assert!(!entries.contains_key("XOffsetUnit"));
        // No ImageSize entry to merge into.
        assert_eq!(entries.get("ImageSizeUnit").map(String::as_str), Some("pixels"));
    }
}
