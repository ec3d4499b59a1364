//! Quazar NPIC scan files.
//!
//! An NPIC file is just several protocol 4 pickles written back to back:
//! one `numpy.ndarray` per channel and direction, and a dict with the scan
//! parameters.

use std::{collections::BTreeMap, fmt, fs, path::Path};

use anyhow::{anyhow, ensure, Result};
use log::{debug, info};

use crate::{
    eval::PickleStream,
    extract::{extract_array, extract_metadata, Metadata, NdArray},
};

pub const EXTENSION: &str = ".npic";

/// Protocol 4 header: `PROTO 4`, `FRAME` with an 8 byte length we don't
/// care about, then the module name of `_reconstruct`.
const MAGIC_HEAD: &[u8] = b"\x80\x04\x95";
const MAGIC_TAIL: &[u8] = b"\x8c\x15numpy.core.multiarray";
const FRAME_LEN_SIZE: usize = 8;

/// How much of the end of the file [`detect`] looks at.
pub const PROBE_SIZE: usize = 4096;

/// Keys of the metadata dict, in the order they are usually written.
const PARAM_NAMES: [&str; 12] = [
    "StepSize",
    "ImageSize",
    "ImageSizeUnit",
    "NoOfChannels",
    "ChannelNames",
    "Instrument",
    "XCalibration",
    "XCalibrationUnit",
    "YCalibration",
    "YCalibrationUnit",
    "ZCalibration",
    "ZCalibrationUnit",
];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Score how likely a file is NPIC, from 0 to 100.
///
/// With `contents` of `None` only the file name is considered.
pub fn detect(name: &str, contents: Option<&[u8]>) -> u32 {
    let Some(buf) = contents else {
        return if name.to_lowercase().ends_with(EXTENSION) {
            10
        } else {
            0
        };
    };

    let magic_len = MAGIC_HEAD.len() + FRAME_LEN_SIZE + MAGIC_TAIL.len();
    if buf.len() < magic_len
        || !buf.starts_with(MAGIC_HEAD)
        || !buf[MAGIC_HEAD.len() + FRAME_LEN_SIZE..].starts_with(MAGIC_TAIL)
    {
        return 0;
    }

    let tail = &buf[buf.len().saturating_sub(PROBE_SIZE)..];
    let mut found = 0;
    for (i, name) in PARAM_NAMES.iter().enumerate() {
        if contains(tail, name.as_bytes()) {
            found += 1;
        }
        // Give up early once too many are missing.
        if found < (i + 1) / 2 && found < i.max(2) - 2 {
            return 0;
        }
    }
    debug!("found {found} of {} parameter names", PARAM_NAMES.len());
    (50 + 48 * found / PARAM_NAMES.len()) as u32
}

/// SI prefixes we know, with their powers of ten.
const PREFIXES: [(&str, i32); 16] = [
    ("Y", 24),
    ("Z", 21),
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
    ("m", -3),
    ("µ", -6),
    ("u", -6),
    ("n", -9),
    ("p", -12),
    ("f", -15),
    ("a", -18),
    ("z", -21),
];

/// Units a prefix may be attached to. These are never split themselves.
const BASE_UNITS: [&str; 12] = [
    "m", "V", "A", "s", "Hz", "N", "Pa", "K", "deg", "rad", "mol", "cd",
];

/// Split a unit string into a power of ten and the remaining unit, e.g.
/// `nm/V` is `(-9, "m/V")`. A prefix is only taken off a known base unit,
/// anything else comes back unchanged with a power of zero.
pub fn split_unit(unit: &str) -> (i32, String) {
    let unit = unit.trim();
    let (num, den) = match unit.split_once('/') {
        Some((n, d)) => (n.trim(), Some(d.trim())),
        None => (unit, None),
    };
    let (power10, base) = if num.is_empty() || BASE_UNITS.contains(&num) {
        (0, num)
    } else {
        PREFIXES
            .iter()
            .find_map(|&(p, power)| {
                num.strip_prefix(p)
                    .filter(|rest| BASE_UNITS.contains(rest))
                    .map(|rest| (power, rest))
            })
            .unwrap_or((0, num))
    };
    match den {
        Some(den) => (power10, format!("{base}/{den}")),
        None => (power10, base.to_owned()),
    }
}

/// Multiply a unit by volts, cancelling a `/V` if there is one.
fn times_volt(unit: &str) -> String {
    if let Some(base) = unit.strip_suffix("/V") {
        base.to_owned()
    } else if unit.is_empty() {
        "V".to_owned()
    } else if let Some((num, den)) = unit.split_once('/') {
        format!("{num} V/{den}")
    } else {
        format!("{unit} V")
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One channel in one scan direction.
pub struct NpicChannel {
    pub title: String,
    pub xres: usize,
    pub yres: usize,
    /// Physical width, in `xy_unit`.
    pub x_real: f64,
    /// Physical height, in `xy_unit`.
    pub y_real: f64,
    pub xy_unit: String,
    pub z_unit: String,
    /// Row-major, `xres * yres` values in `z_unit`.
    pub data: Vec<f64>,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpicFile {
    pub channels: Vec<NpicChannel>,
    pub metadata: Metadata,
}

impl NpicFile {
    pub fn new_from_file<P: AsRef<Path>>(filename: P) -> Result<Self> {
        let buf = fs::read(filename)?;
        Self::from_bytes(&buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut arrays = Vec::new();
        let mut metadata = None;

        let mut count = 0;
        for pickle in PickleStream::new(buf) {
            let pickle = pickle?;
            count += 1;
            let root = pickle.root();
            if let Some(arr) = extract_array(root) {
                arrays.push(arr);
            } else if metadata.is_none() {
                metadata = extract_metadata(root);
            }
        }
        debug!("{count} pickles, {} arrays", arrays.len());

        ensure!(!arrays.is_empty(), "No image data found");
        let metadata = metadata.ok_or_else(|| anyhow!("No metadata dict found"))?;

        let channels = arrays
            .iter()
            .enumerate()
            .map(|(i, arr)| make_channel(i, arr, &metadata))
            .collect::<Vec<_>>();
        info!("loaded {} channels", channels.len());
        Ok(Self { channels, metadata })
    }
}

fn channel_title(i: usize, names: &[String]) -> String {
    let dir = if i % 2 == 1 { "[Backward]" } else { "[Forward]" };
    match names.get(i / 2) {
        Some(name) => format!("{name} {dir}"),
        None => format!("Channel {} {dir}", i / 2),
    }
}

fn make_channel(i: usize, arr: &NdArray, meta: &Metadata) -> NpicChannel {
    let (xy_power, xy_base) = split_unit(meta.x_cal_unit.as_deref().unwrap_or_default());
    let q = 10f64.powi(xy_power);
    let x_real = q * meta.x_step * meta.x_cal / 100.0 * arr.cols as f64;
    let y_real = q * meta.y_step * meta.y_cal / 100.0 * arr.rows as f64;

    let (z_power, z_base) = split_unit(meta.z_cal_unit.as_deref().unwrap_or_default());
    let zq = -10f64.powi(z_power) * meta.z_cal / 100.0;
    let data = arr.values().into_iter().map(|v| v * zq).collect();

    NpicChannel {
        title: channel_title(i, &meta.channel_names),
        xres: arr.cols,
        yres: arr.rows,
        x_real,
        y_real,
        xy_unit: times_volt(&xy_base),
        z_unit: times_volt(&z_base),
        data,
        meta: meta.entries.clone(),
    }
}

impl fmt::Display for NpicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}x{} px, {} x {} {}, values in {}",
            self.title, self.xres, self.yres, self.x_real, self.y_real, self.xy_unit, self.z_unit
        )
    }
}
