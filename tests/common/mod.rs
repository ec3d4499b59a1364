#![allow(dead_code)]

//! A tiny pickle writer, emitting the same opcodes Python's protocol 4
//! pickler uses for NumPy arrays and plain dicts.

use npic_pickle::ops::p_op;

#[derive(Debug, Default)]
pub struct PickleWriter {
    buf: Vec<u8>,
    memo: u8,
}

impl PickleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `PROTO 4` followed by a `FRAME` with a bogus length.
    pub fn protocol4() -> Self {
        let mut w = Self::new();
        w.raw(&[p_op::PROTO, 4, p_op::FRAME]).raw(&[0u8; 8]);
        w
    }

    pub fn raw(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn op(&mut self, code: u8) -> &mut Self {
        self.buf.push(code);
        self
    }

    /// Memoize the stack top and return its memo index.
    pub fn memoize(&mut self) -> u8 {
        self.buf.push(p_op::MEMOIZE);
        self.memo += 1;
        self.memo - 1
    }

    pub fn binget(&mut self, index: u8) -> &mut Self {
        self.raw(&[p_op::BINGET, index])
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        if s.len() < 256 {
            self.raw(&[p_op::SHORT_BINUNICODE, s.len() as u8]).raw(s.as_bytes())
        } else {
            self.op(p_op::BINUNICODE)
                .raw(&(s.len() as u32).to_le_bytes())
                .raw(s.as_bytes())
        }
    }

    pub fn int(&mut self, i: i32) -> &mut Self {
        match i {
            0..=0xff => self.raw(&[p_op::BININT1, i as u8]),
            0x100..=0xffff => self.op(p_op::BININT2).raw(&(i as u16).to_le_bytes()),
            _ => self.op(p_op::BININT).raw(&i.to_le_bytes()),
        }
    }

    pub fn float(&mut self, v: f64) -> &mut Self {
        self.op(p_op::BINFLOAT).raw(&v.to_be_bytes())
    }

    pub fn bool(&mut self, b: bool) -> &mut Self {
        self.op(if b { p_op::NEWTRUE } else { p_op::NEWFALSE })
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        if b.len() < 256 {
            self.raw(&[p_op::SHORT_BINBYTES, b.len() as u8]).raw(b)
        } else {
            self.op(p_op::BINBYTES)
                .raw(&(b.len() as u32).to_le_bytes())
                .raw(b)
        }
    }

    pub fn stop(&mut self) -> &mut Self {
        self.op(p_op::STOP)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Pickle a 2D array the way `pickle.dumps(arr, protocol=4)` does.
pub fn ndarray_pickle(rows: i32, cols: i32, code: &str, order: &str, payload: &[u8]) -> Vec<u8> {
    let mut w = PickleWriter::protocol4();
    w.str("numpy.core.multiarray");
    w.memoize();
    w.str("_reconstruct");
    w.memoize();
    w.op(p_op::STACK_GLOBAL);
    w.memoize();
    w.str("numpy");
    let numpy = w.memoize();
    w.str("ndarray");
    w.memoize();
    w.op(p_op::STACK_GLOBAL);
    w.memoize();
    w.int(0).op(p_op::TUPLE1);
    w.memoize();
    w.bytes(b"b");
    w.memoize();
    w.op(p_op::TUPLE3);
    w.memoize();
    w.op(p_op::REDUCE);
    w.memoize();

    // State: (1, (rows, cols), dtype, False, data)
    w.op(p_op::MARK).int(1).int(rows).int(cols).op(p_op::TUPLE2);
    w.memoize();
    w.binget(numpy).str("dtype");
    w.memoize();
    w.op(p_op::STACK_GLOBAL);
    w.memoize();
    w.str(code);
    w.memoize();
    w.bool(false).bool(true).op(p_op::TUPLE3);
    w.memoize();
    w.op(p_op::REDUCE);
    w.memoize();
    w.op(p_op::MARK).int(3).str(order);
    w.memoize();
    w.op(p_op::NONE).op(p_op::NONE).op(p_op::NONE);
    w.op(p_op::BININT).raw(&(-1i32).to_le_bytes());
    w.op(p_op::BININT).raw(&(-1i32).to_le_bytes());
    w.int(0).op(p_op::TUPLE);
    w.memoize();
    w.op(p_op::BUILD).bool(false).bytes(payload);
    w.memoize();
    w.op(p_op::TUPLE);
    w.memoize();
    w.op(p_op::BUILD).stop();
    w.finish()
}

/// Little endian `f4` payload.
pub fn f4_le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Big endian `f8` payload.
pub fn f8_be(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// A metadata dict value.
pub enum Meta<'a> {
    Str(&'a str),
    Int(i32),
    Float(f64),
    Bool(bool),
    Floats(&'a [f64]),
    Strs(&'a [&'a str]),
}

/// Pickle a flat dict like `pickle.dumps(d, protocol=4)`.
pub fn dict_pickle(entries: &[(&str, Meta<'_>)]) -> Vec<u8> {
    let mut w = PickleWriter::protocol4();
    w.op(p_op::EMPTY_DICT);
    w.memoize();
    w.op(p_op::MARK);
    for (key, value) in entries {
        w.str(key);
        w.memoize();
        match value {
            Meta::Str(s) => {
                w.str(s);
                w.memoize();
            }
            Meta::Int(i) => {
                w.int(*i);
            }
            Meta::Float(v) => {
                w.float(*v);
            }
            Meta::Bool(b) => {
                w.bool(*b);
            }
            Meta::Floats(vs) => {
                w.op(p_op::EMPTY_LIST);
                w.memoize();
                w.op(p_op::MARK);
                for v in vs.iter() {
                    w.float(*v);
                }
                w.op(p_op::APPENDS);
            }
            Meta::Strs(ss) => {
                w.op(p_op::EMPTY_LIST);
                w.memoize();
                w.op(p_op::MARK);
                for s in ss.iter() {
                    w.str(s);
                    w.memoize();
                }
                w.op(p_op::APPENDS);
            }
        }
    }
    w.op(p_op::SETITEMS).stop();
    w.finish()
}
