use crate::{
    error::{DecodeError, DecodeResult},
    ops::{self, p_op, OpcodeInfo},
    parsers::{decode_long, parse_arg, Arg, ArgError},
    shape::{check_stack, StackCheck},
    value::*,
};

use std::ops::{Deref, DerefMut};

use log::{debug, trace, warn};

/// Highest protocol we know about. Newer streams are decoded anyway, with a warning.
pub const MAX_PROTOCOL: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Knobs for the interpreter.
pub struct DecodeOptions {
    /// Fail on opcodes we recognize but do not act on (classes, extensions,
    /// persistent ids, ...) instead of just warning about them.
    pub strict: bool,

    /// Protocols above this get a warning. Never a hard error.
    pub max_protocol: u8,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            strict: false,
            max_protocol: MAX_PROTOCOL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
/// Basically just a Vec of owned object references.
pub struct PickleStack(pub Vec<ObjRef>);

impl PickleStack {
    /// Split off everything from `pos` upwards.
    pub fn pop_from(&mut self, pos: usize) -> Vec<ObjRef> {
        self.0.split_off(pos.min(self.0.len()))
    }

    pub fn top(&self) -> Option<ObjRef> {
        self.0.last().copied()
    }

    pub fn release_all(&mut self, heap: &mut Heap) {
        for r in self.0.drain(..) {
            heap.release(r);
        }
    }
}

impl Deref for PickleStack {
    type Target = Vec<ObjRef>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PickleStack {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
/// Append-only memo filled by `MEMOIZE`, read by `BINGET`/`LONG_BINGET`.
/// Every entry owns a reference.
pub struct PickleMemo(pub Vec<ObjRef>);

impl PickleMemo {
    pub fn memoize(&mut self, heap: &mut Heap, obj: ObjRef) {
        self.0.push(heap.retain(obj));
    }

    pub fn get(&self, index: u64) -> Option<ObjRef> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.0.get(i))
            .copied()
    }

    pub fn release_all(&mut self, heap: &mut Heap) {
        for r in self.0.drain(..) {
            heap.release(r);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Stopped,
}

enum Outcome {
    Done,
    Unhandled,
}

struct Interpreter<'a, 'o> {
    input: &'a [u8],
    pos: usize,
    heap: Heap,
    stack: PickleStack,
    memo: PickleMemo,
    protocol: Option<u8>,
    options: &'o DecodeOptions,
}

impl<'a, 'o> Interpreter<'a, 'o> {
    fn new(input: &'a [u8], pos: usize, options: &'o DecodeOptions) -> Self {
        Self {
            input,
            pos,
            heap: Heap::new(),
            stack: PickleStack::default(),
            memo: PickleMemo::default(),
            protocol: None,
            options,
        }
    }

    fn run(mut self) -> DecodeResult<(usize, Pickle)> {
        let start = self.pos;
        let root = match self.run_loop() {
            Ok(root) => root,
            Err(e) => {
                debug!("decoding pickle at offset {start} failed: {e}");
                self.teardown();
                return Err(e);
            }
        };
        self.teardown();
        debug!(
            "decoded pickle at offset {start}, {} bytes, {} live objects",
            self.pos - start,
            self.heap.live_count()
        );
        Ok((self.pos, Pickle::new(self.heap, root)))
    }

    fn run_loop(&mut self) -> DecodeResult<ObjRef> {
        while self.step()? == State::Running {}

        // We get here right after consuming STOP.
        let offset = self.pos - 1;
        match self.stack.as_slice() {
            &[root] => Ok(self.heap.retain(root)),
            _ => Err(DecodeError::InvalidStackShape {
                opcode: p_op::STOP,
                name: "STOP",
                offset,
            }),
        }
    }

    fn teardown(&mut self) {
        self.stack.release_all(&mut self.heap);
        self.memo.release_all(&mut self.heap);
    }

    fn step(&mut self) -> DecodeResult<State> {
        let offset = self.pos;
        let code = *self
            .input
            .get(offset)
            .ok_or(DecodeError::BufferExhausted { offset })?;
        let info = ops::lookup(code).ok_or(DecodeError::UnknownOpcode {
            opcode: code,
            offset,
        })?;

        let (rest, arg) = parse_arg(info.arg, &self.input[offset + 1..]).map_err(|e| {
            let name = info.name;
            match e {
                ArgError::Truncated => DecodeError::TruncatedArgument { name, offset },
                ArgError::InvalidUtf8 => DecodeError::InvalidString { name, offset },
                ArgError::Unsupported => DecodeError::UnsupportedArgument {
                    name,
                    arg: info.arg,
                    offset,
                },
            }
        })?;
        self.pos = self.input.len() - rest.len();
        trace!("{}(0x{code:02x}) at {offset}", info.name);

        if let Some(proto) = self.protocol {
            if info.protocol > proto {
                debug!(
                    "opcode {} belongs to protocol {} but the stream declared {proto}",
                    info.name, info.protocol
                );
            }
        }

        let check = check_stack(&self.stack, &self.heap, info.before)
            .ok_or_else(|| invalid_stack(info, offset))?;

        if info.code == p_op::STOP {
            return Ok(State::Stopped);
        }

        match self.execute(info, arg, check, offset)? {
            Outcome::Done => {
                debug_assert!(
                    check_stack(&self.stack, &self.heap, info.after).is_some(),
                    "{} left the stack in the wrong shape",
                    info.name
                );
            }
            Outcome::Unhandled if self.options.strict => {
                return Err(DecodeError::UnhandledOpcode {
                    name: info.name,
                    offset,
                });
            }
            Outcome::Unhandled => {
                // Classes, extensions and such. We hope to never see them, and if
                // we do the result is probably not what anybody wanted.
                warn!("opcode {}(0x{code:02x}) at {offset} is unhandled", info.name);
            }
        }
        Ok(State::Running)
    }

    fn execute(
        &mut self,
        info: &'static OpcodeInfo,
        arg: Arg<'_>,
        check: StackCheck,
        offset: usize,
    ) -> DecodeResult<Outcome> {
        let invalid = || invalid_stack(info, offset);
        let n = self.stack.len();

        match info.code {
            p_op::MEMOIZE => {
                let top = self.stack.top().ok_or_else(invalid)?;
                trace!("memoize stack top as {}", self.memo.0.len());
                self.memo.memoize(&mut self.heap, top);
            }
            p_op::BINGET | p_op::LONG_BINGET => {
                let obj = arg
                    .as_uint()
                    .and_then(|i| self.memo.get(i))
                    .ok_or_else(invalid)?;
                let obj = self.heap.retain(obj);
                self.stack.push(obj);
            }
            p_op::POP => {
                let obj = self.stack.pop().ok_or_else(invalid)?;
                self.heap.release(obj);
            }
            p_op::POP_MARK => {
                let mark = check.mark.ok_or_else(invalid)?;
                for obj in self.stack.pop_from(mark) {
                    self.heap.release(obj);
                }
            }
            p_op::DUP => {
                let top = self.stack.top().ok_or_else(invalid)?;
                let obj = self.heap.retain(top);
                self.stack.push(obj);
            }
            p_op::PROTO => {
                let proto = arg.as_uint().unwrap_or_default().min(u8::MAX.into()) as u8;
                if proto > self.options.max_protocol {
                    warn!("pickle protocol {proto} is newer than {}", self.options.max_protocol);
                }
                let proto = self.protocol.map_or(proto, |p| p.max(proto));
                debug!("protocol {proto}");
                self.protocol = Some(proto);
            }
            p_op::FRAME => trace!("frame of {:?} bytes", arg.as_uint()),
            p_op::MARK => self.push_new(Object::Mark),
            p_op::NONE => self.push_new(Object::None),
            p_op::NEWTRUE => self.push_new(Object::Bool(true)),
            p_op::NEWFALSE => self.push_new(Object::Bool(false)),
            p_op::BININT
            | p_op::BININT1
            | p_op::BININT2
            | p_op::LONG1
            | p_op::LONG4
            | p_op::BINFLOAT
            | p_op::BINUNICODE
            | p_op::SHORT_BINUNICODE
            | p_op::BINUNICODE8
            | p_op::BINSTRING
            | p_op::SHORT_BINSTRING
            | p_op::BINBYTES
            | p_op::SHORT_BINBYTES
            | p_op::BINBYTES8
            | p_op::BYTEARRAY8 => {
                let obj = literal(info, arg, offset)?;
                self.push_new(obj);
            }
            p_op::EMPTY_LIST | p_op::EMPTY_TUPLE => self.push_new(Object::Seq(vec![])),
            p_op::EMPTY_DICT => self.push_new(Object::Dict(vec![])),
            p_op::EMPTY_SET => self.push_new(Object::Set(vec![])),
            p_op::TUPLE1 => self.make_from_top(1, Object::Seq),
            p_op::TUPLE2 => self.make_from_top(2, Object::Seq),
            p_op::TUPLE3 => self.make_from_top(3, Object::Seq),
            p_op::TUPLE | p_op::LIST | p_op::FROZENSET | p_op::DICT => {
                let mark = check.mark.ok_or_else(invalid)?;
                let items = self.stack.pop_from(mark + 1);
                // DICT's stack shape is a plain slice, so pairing is checked here.
                if info.code == p_op::DICT && items.len() % 2 != 0 {
                    self.stack.extend(items);
                    return Err(invalid());
                }
                if let Some(mark) = self.stack.pop() {
                    self.heap.release(mark);
                }
                self.push_new(match info.code {
                    p_op::FROZENSET => Object::Set(items),
                    p_op::DICT => Object::Dict(items),
                    _ => Object::Seq(items),
                });
            }
            p_op::APPEND => self.append_to(n.wrapping_sub(2), false, ObjectTag::Seq, info, offset)?,
            p_op::SETITEM => {
                self.append_to(n.wrapping_sub(3), false, ObjectTag::Dict, info, offset)?
            }
            p_op::APPENDS | p_op::ADDITEMS | p_op::SETITEMS => {
                let objpos = check
                    .mark
                    .and_then(|m| m.checked_sub(1))
                    .ok_or_else(invalid)?;
                let tag = match info.code {
                    p_op::APPENDS => ObjectTag::Seq,
                    p_op::ADDITEMS => ObjectTag::Set,
                    _ => ObjectTag::Dict,
                };
                self.append_to(objpos, true, tag, info, offset)?;
            }
            p_op::STACK_GLOBAL => self.make_pair(Object::Global, info, offset)?,
            p_op::REDUCE => self.make_pair(Object::Reduce, info, offset)?,
            p_op::BUILD => self.make_pair(Object::Built, info, offset)?,
            _ => return Ok(Outcome::Unhandled),
        }
        Ok(Outcome::Done)
    }

    fn push_new(&mut self, obj: Object) {
        let r = self.heap.alloc(obj);
        self.stack.push(r);
    }

    /// Replace the topmost `count` items by a new container holding them.
    fn make_from_top(&mut self, count: usize, ctor: fn(Vec<ObjRef>) -> Object) {
        let items = self.stack.pop_from(self.stack.len().saturating_sub(count));
        self.push_new(ctor(items));
    }

    fn make_pair(
        &mut self,
        ctor: fn([ObjRef; 2]) -> Object,
        info: &'static OpcodeInfo,
        offset: usize,
    ) -> DecodeResult<()> {
        let items = self.stack.pop_from(self.stack.len().saturating_sub(2));
        let pair: [ObjRef; 2] = match items.try_into() {
            Ok(pair) => pair,
            Err(items) => {
                self.stack.extend(items);
                return Err(invalid_stack(info, offset));
            }
        };
        self.push_new(ctor(pair));
        Ok(())
    }

    /// Move everything above `objpos` (and above the mark right after it, if
    /// `has_mark`) into the container at `objpos`. The stack ends just past
    /// the container.
    fn append_to(
        &mut self,
        objpos: usize,
        has_mark: bool,
        expected: ObjectTag,
        info: &'static OpcodeInfo,
        offset: usize,
    ) -> DecodeResult<()> {
        let target = self
            .stack
            .get(objpos)
            .copied()
            .filter(|&r| self.heap.tag(r) == Some(expected))
            .ok_or_else(|| invalid_stack(info, offset))?;
        let first = objpos + 1 + usize::from(has_mark);
        // An item that leads back to the target would close a cycle, and
        // refcounting can never free one.
        if self.stack[first.min(self.stack.len())..]
            .iter()
            .any(|&r| self.heap.reaches(r, target))
        {
            debug!("{} at {offset} would make {target:?} contain itself", info.name);
            return Err(invalid_stack(info, offset));
        }
        let items = self.stack.pop_from(first);
        if has_mark {
            if let Some(mark) = self.stack.pop() {
                self.heap.release(mark);
            }
        }
        match self.heap.get_mut(target).and_then(Object::items_mut) {
            Some(list) => {
                list.extend(items);
                Ok(())
            }
            None => {
                for r in items {
                    self.heap.release(r);
                }
                Err(invalid_stack(info, offset))
            }
        }
    }
}

fn invalid_stack(info: &OpcodeInfo, offset: usize) -> DecodeError {
    DecodeError::InvalidStackShape {
        opcode: info.code,
        name: info.name,
        offset,
    }
}

/// Build the object a literal producing opcode pushes. Strings and bytes are
/// copied out of the input.
fn literal(info: &'static OpcodeInfo, arg: Arg<'_>, offset: usize) -> DecodeResult<Object> {
    let unsupported = || DecodeError::UnsupportedArgument {
        name: info.name,
        arg: info.arg,
        offset,
    };
    Ok(match arg {
        Arg::UInt(v) => Object::Int(i64::try_from(v).map_err(|_| unsupported())?),
        Arg::Int(v) => Object::Int(v),
        Arg::Long(b) => Object::Int(decode_long(b).ok_or_else(unsupported)?),
        Arg::Float(v) => Object::Float(v),
        Arg::Unicode(s) => Object::String(s.to_owned()),
        // Legacy strings have no declared encoding. Keep them as strings when
        // we can, bytes otherwise.
        Arg::Bytes(b) if matches!(info.code, p_op::BINSTRING | p_op::SHORT_BINSTRING) => {
            match std::str::from_utf8(b) {
                Ok(s) => Object::String(s.to_owned()),
                Err(_) => Object::Bytes(b.to_vec()),
            }
        }
        Arg::Bytes(b) => Object::Bytes(b.to_vec()),
        Arg::None => return Err(unsupported()),
    })
}

/// Decode one pickle from the start of `input` with default options.
/// You get the remaining input back, nom style.
pub fn evaluate(input: &[u8]) -> DecodeResult<(&[u8], Pickle)> {
    evaluate_with(input, &DecodeOptions::default())
}

/// Decode one pickle from the start of `input`.
pub fn evaluate_with<'a>(
    input: &'a [u8],
    options: &DecodeOptions,
) -> DecodeResult<(&'a [u8], Pickle)> {
    let (end, pickle) = Interpreter::new(input, 0, options).run()?;
    Ok((&input[end..], pickle))
}

#[derive(Debug, Clone)]
/// Iterator over pickles stored back to back in one buffer. Error offsets
/// are relative to the whole buffer. Iteration ends at the end of the input
/// or after the first error, since there is no way to resynchronize.
pub struct PickleStream<'a> {
    input: &'a [u8],
    pos: usize,
    options: DecodeOptions,
    failed: bool,
}

impl<'a> PickleStream<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self::with_options(input, DecodeOptions::default())
    }

    pub fn with_options(input: &'a [u8], options: DecodeOptions) -> Self {
        Self {
            input,
            pos: 0,
            options,
            failed: false,
        }
    }

    /// Where the next pickle starts.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl Iterator for PickleStream<'_> {
    type Item = DecodeResult<Pickle>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.input.len() {
            return None;
        }
        match Interpreter::new(self.input, self.pos, &self.options).run() {
            Ok((end, pickle)) => {
                self.pos = end;
                Some(Ok(pickle))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
