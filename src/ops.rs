use once_cell::sync::Lazy;

/// Opcode bytes, named the way Python's `pickletools` names them.
pub mod p_op {
    pub const MARK: u8 = b'(';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const EMPTY_LIST: u8 = b']';
    pub const EMPTY_DICT: u8 = b'}';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const APPEND: u8 = b'a';
    pub const BINBYTES: u8 = b'B';
    pub const BUILD: u8 = b'b';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const APPENDS: u8 = b'e';
    pub const FLOAT: u8 = b'F';
    pub const BINFLOAT: u8 = b'G';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INT: u8 = b'I';
    pub const INST: u8 = b'i';
    pub const BININT: u8 = b'J';
    pub const LONG_BINGET: u8 = b'j';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const LONG: u8 = b'L';
    pub const LIST: u8 = b'l';
    pub const NONE: u8 = b'N';
    pub const OBJ: u8 = b'o';
    pub const PERSID: u8 = b'P';
    pub const PUT: u8 = b'p';
    pub const BINPERSID: u8 = b'Q';
    pub const BINPUT: u8 = b'q';
    pub const REDUCE: u8 = b'R';
    pub const LONG_BINPUT: u8 = b'r';
    pub const STRING: u8 = b'S';
    pub const SETITEM: u8 = b's';
    pub const BINSTRING: u8 = b'T';
    pub const TUPLE: u8 = b't';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const SETITEMS: u8 = b'u';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the bytes following an opcode are encoded.
pub enum ArgKind {
    None,
    /// Bytes with a 1-byte length prefix.
    Bytes1,
    Bytes4,
    Bytes8,
    DecimalNlLong,
    DecimalNlShort,
    /// Big endian IEEE-754 double. Yes, big endian, unlike every integer.
    Float8,
    FloatNl,
    /// Signed 4-byte little endian integer.
    Int4,
    /// Two's complement integer with a 1-byte length prefix.
    Long1,
    Long4,
    /// Legacy (Python 2 `str`) strings with a length prefix.
    String1,
    String4,
    StringNl,
    StringNlNoEscape,
    StringNlNoEscapePair,
    UInt1,
    UInt2,
    UInt4,
    UInt8,
    UnicodeString1,
    UnicodeString4,
    UnicodeString8,
    UnicodeStringNl,
}

impl ArgKind {
    /// Whether this is one of the newline terminated textual encodings.
    /// We never decode those.
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            Self::DecimalNlLong
                | Self::DecimalNlShort
                | Self::FloatNl
                | Self::StringNl
                | Self::StringNlNoEscape
                | Self::StringNlNoEscapePair
                | Self::UnicodeStringNl
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Stack contracts. Used both as "what must be on the stack before"
/// and "what is on the stack after" an opcode runs.
pub enum StackShape {
    Void,
    AnyObject,
    AnyObject2,
    AnyObject3,
    MarkObject,
    MarkObjectAnyObjectStackSlice,
    MarkObjectStackSlice,
    PyBool,
    PyBytes,
    PyBytesOrStr,
    PyDict,
    PyDictAnyObject2,
    PyDictMarkObjectStackSlice,
    PyFloat,
    PyFrozenSet,
    PyInt,
    PyIntegerOrBool,
    PyList,
    PyListAnyObject,
    PyListMarkObjectStackSlice,
    PyNone,
    PySet,
    PySetMarkObjectStackSlice,
    PyTuple,
    PyUnicode,
    PyUnicodePyUnicode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One row of the opcode table.
pub struct OpcodeInfo {
    pub code: u8,
    pub name: &'static str,
    /// Protocol the opcode appeared in. Only used for diagnostics.
    pub protocol: u8,
    pub arg: ArgKind,
    pub before: StackShape,
    pub after: StackShape,
}

const fn op(
    code: u8,
    protocol: u8,
    arg: ArgKind,
    before: StackShape,
    after: StackShape,
    name: &'static str,
) -> OpcodeInfo {
    OpcodeInfo {
        code,
        name,
        protocol,
        arg,
        before,
        after,
    }
}

use self::{ArgKind as A, StackShape as S};

/// Every opcode we recognize, whether or not the interpreter acts on it.
#[rustfmt::skip]
pub static OPCODES: &[OpcodeInfo] = &[
    op(p_op::ADDITEMS,         4, A::None,                 S::PySetMarkObjectStackSlice,     S::PySet,            "ADDITEMS"),
    op(p_op::APPEND,           0, A::None,                 S::PyListAnyObject,               S::PyList,           "APPEND"),
    op(p_op::APPENDS,          1, A::None,                 S::PyListMarkObjectStackSlice,    S::PyList,           "APPENDS"),
    op(p_op::BINBYTES,         3, A::Bytes4,               S::Void,                          S::PyBytes,          "BINBYTES"),
    op(p_op::BINBYTES8,        4, A::Bytes8,               S::Void,                          S::PyBytes,          "BINBYTES8"),
    op(p_op::BINFLOAT,         1, A::Float8,               S::Void,                          S::PyFloat,          "BINFLOAT"),
    op(p_op::BINGET,           1, A::UInt1,                S::Void,                          S::AnyObject,        "BINGET"),
    op(p_op::BININT1,          1, A::UInt1,                S::Void,                          S::PyInt,            "BININT1"),
    op(p_op::BININT,           1, A::Int4,                 S::Void,                          S::PyInt,            "BININT"),
    op(p_op::BININT2,          1, A::UInt2,                S::Void,                          S::PyInt,            "BININT2"),
    op(p_op::BINPERSID,        1, A::None,                 S::AnyObject,                     S::AnyObject,        "BINPERSID"),
    op(p_op::BINPUT,           1, A::UInt1,                S::Void,                          S::Void,             "BINPUT"),
    op(p_op::BINSTRING,        1, A::String4,              S::Void,                          S::PyBytesOrStr,     "BINSTRING"),
    op(p_op::BINUNICODE,       1, A::UnicodeString4,       S::Void,                          S::PyUnicode,        "BINUNICODE"),
    op(p_op::BINUNICODE8,      4, A::UnicodeString8,       S::Void,                          S::PyUnicode,        "BINUNICODE8"),
    op(p_op::BUILD,            0, A::None,                 S::AnyObject2,                    S::AnyObject,        "BUILD"),
    op(p_op::BYTEARRAY8,       5, A::Bytes8,               S::Void,                          S::PyBytes,          "BYTEARRAY8"),
    op(p_op::DICT,             0, A::None,                 S::MarkObjectStackSlice,          S::PyDict,           "DICT"),
    op(p_op::DUP,              0, A::None,                 S::AnyObject,                     S::AnyObject2,       "DUP"),
    op(p_op::EMPTY_DICT,       1, A::None,                 S::Void,                          S::PyDict,           "EMPTY_DICT"),
    op(p_op::EMPTY_LIST,       1, A::None,                 S::Void,                          S::PyList,           "EMPTY_LIST"),
    op(p_op::EMPTY_SET,        4, A::None,                 S::Void,                          S::PySet,            "EMPTY_SET"),
    op(p_op::EMPTY_TUPLE,      1, A::None,                 S::Void,                          S::PyTuple,          "EMPTY_TUPLE"),
    op(p_op::EXT1,             2, A::UInt1,                S::Void,                          S::AnyObject,        "EXT1"),
    op(p_op::EXT2,             2, A::UInt2,                S::Void,                          S::AnyObject,        "EXT2"),
    op(p_op::EXT4,             2, A::Int4,                 S::Void,                          S::AnyObject,        "EXT4"),
    op(p_op::FLOAT,            0, A::FloatNl,              S::Void,                          S::PyFloat,          "FLOAT"),
    op(p_op::FRAME,            4, A::UInt8,                S::Void,                          S::Void,             "FRAME"),
    op(p_op::FROZENSET,        4, A::None,                 S::MarkObjectStackSlice,          S::PyFrozenSet,      "FROZENSET"),
    op(p_op::GET,              0, A::DecimalNlShort,       S::Void,                          S::AnyObject,        "GET"),
    op(p_op::GLOBAL,           0, A::StringNlNoEscapePair, S::Void,                          S::AnyObject,        "GLOBAL"),
    op(p_op::INST,             0, A::StringNlNoEscapePair, S::MarkObjectStackSlice,          S::AnyObject,        "INST"),
    op(p_op::INT,              0, A::DecimalNlShort,       S::Void,                          S::PyIntegerOrBool,  "INT"),
    op(p_op::LIST,             0, A::None,                 S::MarkObjectStackSlice,          S::PyList,           "LIST"),
    op(p_op::LONG,             0, A::DecimalNlLong,        S::Void,                          S::PyInt,            "LONG"),
    op(p_op::LONG1,            2, A::Long1,                S::Void,                          S::PyInt,            "LONG1"),
    op(p_op::LONG4,            2, A::Long4,                S::Void,                          S::PyInt,            "LONG4"),
    op(p_op::LONG_BINGET,      1, A::UInt4,                S::Void,                          S::AnyObject,        "LONG_BINGET"),
    op(p_op::LONG_BINPUT,      1, A::UInt4,                S::Void,                          S::Void,             "LONG_BINPUT"),
    op(p_op::MARK,             0, A::None,                 S::Void,                          S::MarkObject,       "MARK"),
    op(p_op::MEMOIZE,          4, A::None,                 S::AnyObject,                     S::AnyObject,        "MEMOIZE"),
    op(p_op::NEWFALSE,         2, A::None,                 S::Void,                          S::PyBool,           "NEWFALSE"),
    op(p_op::NEWOBJ,           2, A::None,                 S::AnyObject2,                    S::AnyObject,        "NEWOBJ"),
    op(p_op::NEWOBJ_EX,        4, A::None,                 S::AnyObject3,                    S::AnyObject,        "NEWOBJ_EX"),
    op(p_op::NEWTRUE,          2, A::None,                 S::Void,                          S::PyBool,           "NEWTRUE"),
    op(p_op::NEXT_BUFFER,      5, A::None,                 S::Void,                          S::AnyObject,        "NEXT_BUFFER"),
    op(p_op::NONE,             0, A::None,                 S::Void,                          S::PyNone,           "NONE"),
    op(p_op::OBJ,              1, A::None,                 S::MarkObjectAnyObjectStackSlice, S::AnyObject,        "OBJ"),
    op(p_op::PERSID,           0, A::StringNlNoEscape,     S::Void,                          S::AnyObject,        "PERSID"),
    op(p_op::POP,              0, A::None,                 S::AnyObject,                     S::Void,             "POP"),
    op(p_op::POP_MARK,         1, A::None,                 S::MarkObjectStackSlice,          S::Void,             "POP_MARK"),
    op(p_op::PROTO,            2, A::UInt1,                S::Void,                          S::Void,             "PROTO"),
    op(p_op::PUT,              0, A::DecimalNlShort,       S::Void,                          S::Void,             "PUT"),
    op(p_op::READONLY_BUFFER,  5, A::None,                 S::AnyObject,                     S::AnyObject,        "READONLY_BUFFER"),
    op(p_op::REDUCE,           0, A::None,                 S::AnyObject2,                    S::AnyObject,        "REDUCE"),
    op(p_op::SETITEM,          0, A::None,                 S::PyDictAnyObject2,              S::PyDict,           "SETITEM"),
    op(p_op::SETITEMS,         1, A::None,                 S::PyDictMarkObjectStackSlice,    S::PyDict,           "SETITEMS"),
    op(p_op::SHORT_BINBYTES,   3, A::Bytes1,               S::Void,                          S::PyBytes,          "SHORT_BINBYTES"),
    op(p_op::SHORT_BINSTRING,  1, A::String1,              S::Void,                          S::PyBytesOrStr,     "SHORT_BINSTRING"),
    op(p_op::SHORT_BINUNICODE, 4, A::UnicodeString1,       S::Void,                          S::PyUnicode,        "SHORT_BINUNICODE"),
    op(p_op::STACK_GLOBAL,     4, A::None,                 S::PyUnicodePyUnicode,            S::AnyObject,        "STACK_GLOBAL"),
    op(p_op::STOP,             0, A::None,                 S::AnyObject,                     S::Void,             "STOP"),
    op(p_op::STRING,           0, A::StringNl,             S::Void,                          S::PyBytesOrStr,     "STRING"),
    op(p_op::TUPLE,            0, A::None,                 S::MarkObjectStackSlice,          S::PyTuple,          "TUPLE"),
    op(p_op::TUPLE1,           2, A::None,                 S::AnyObject,                     S::PyTuple,          "TUPLE1"),
    op(p_op::TUPLE2,           2, A::None,                 S::AnyObject2,                    S::PyTuple,          "TUPLE2"),
    op(p_op::TUPLE3,           2, A::None,                 S::AnyObject3,                    S::PyTuple,          "TUPLE3"),
    op(p_op::UNICODE,          0, A::UnicodeStringNl,      S::Void,                          S::PyUnicode,        "UNICODE"),
];

static OPCODE_INDEX: Lazy<[Option<&'static OpcodeInfo>; 256]> = Lazy::new(|| {
    let mut index = [None; 256];
    for info in OPCODES.iter() {
        index[info.code as usize] = Some(info);
    }
    index
});

/// Look up the table entry for an opcode byte.
pub fn lookup(code: u8) -> Option<&'static OpcodeInfo> {
    OPCODE_INDEX[code as usize]
}
