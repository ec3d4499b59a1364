//! A small, restricted Python pickle interpreter, just capable enough to
//! recover NumPy arrays and metadata dicts from Quazar NPIC files.
//!
//! Nothing is ever imported or called. `GLOBAL`, `REDUCE` and `BUILD` are
//! kept as plain objects you can pattern match on.
//!
//! See the programs in the `demos/` directory.
//!
//! Something to get you started:
//!
//! ```rust
//! use anyhow::Result;
//! use npic_pickle as np;
//!
//! fn main() -> Result<()> {
//!     // {'Direction': 2}
//!     let b = b"\x80\x04}\x94\x8c\tDirection\x94K\x02s.";
//!     let (remaining_input, pickle) = np::evaluate(b)?;
//!     assert!(remaining_input.is_empty());
//!     let meta = np::extract_metadata(pickle.root());
//!     assert_eq!(meta.unwrap().entries["Direction"], "2");
//!     Ok(())
//! }
//! ```
//!
//! Decoded objects print as an indented tree:
//!
//! ```plaintext
//! DICT(nitems=4)
//!     STRING('StepSize')
//!     SEQ(nitems=2)
//!         FLOAT(0.5)
//!         FLOAT(0.5)
//!     STRING('XCalibrationUnit')
//!     STRING('nm/V')
//! ```

/// Decode errors.
pub mod error;

/// The interpreter loop, plus the stack and memo it works on.
pub mod eval;

/// Recognizing `ndarray` and metadata shapes in decoded objects.
pub mod extract;

/// Loading Quazar NPIC files.
pub mod npic;

/// The opcode table.
pub mod ops;

/// Parsers for opcode arguments.
pub mod parsers;

/// Stack shape checks done before and after every opcode.
pub mod shape;

/// Objects and the heap they live in.
pub mod value;

pub use crate::error::{DecodeError, DecodeResult, ErrorKind};

pub use crate::eval::{evaluate, evaluate_with, DecodeOptions, PickleStream};

pub use crate::extract::{extract_array, extract_metadata, ByteOrder, DType, Metadata, NdArray};

pub use crate::npic::{NpicChannel, NpicFile};

pub use crate::value::{Heap, ObjRef, Object, ObjectTag, Pickle, View};
