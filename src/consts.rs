// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle opcodes and protocol numbers.
//!
//! Opcode names follow Python's pickle.py, grouped by the protocol that
//! introduced them.

/// Protocol written by the primary save method.
pub const PRIMARY_PROTOCOL: u8 = 3;
/// Protocol written by the secondary ("extended") save method.
pub const EXTENDED_PROTOCOL: u8 = 4;
/// Highest protocol the reader accepts in a PROTO opcode.
pub const HIGHEST_PROTOCOL: u8 = 5;

// Protocol 0: text opcodes.
pub const MARK             : u8 = b'(';
pub const STOP             : u8 = b'.';
pub const POP              : u8 = b'0';
pub const POP_MARK         : u8 = b'1';
pub const DUP              : u8 = b'2';
pub const FLOAT            : u8 = b'F';    // decimal string argument
pub const INT              : u8 = b'I';    // decimal string argument; "00"/"01" are bools
pub const LONG             : u8 = b'L';    // decimal string argument, optional "L" suffix
pub const NONE             : u8 = b'N';
pub const PERSID           : u8 = b'P';
pub const STRING           : u8 = b'S';    // quoted, escaped, newline-terminated
pub const UNICODE          : u8 = b'V';    // raw-unicode-escaped, newline-terminated
pub const APPEND           : u8 = b'a';
pub const BUILD            : u8 = b'b';    // __setstate__ or __dict__.update()
pub const GLOBAL           : u8 = b'c';    // module and name as two lines
pub const DICT             : u8 = b'd';
pub const GET              : u8 = b'g';
pub const INST             : u8 = b'i';    // module and name lines, args above mark
pub const LIST             : u8 = b'l';
pub const PUT              : u8 = b'p';
pub const SETITEM          : u8 = b's';
pub const TUPLE            : u8 = b't';
pub const REDUCE           : u8 = b'R';

// Protocol 1: binary opcodes.
pub const BINFLOAT         : u8 = b'G';    // 8-byte big-endian float
pub const BININT           : u8 = b'J';    // 4-byte signed int
pub const BININT1          : u8 = b'K';    // 1-byte unsigned int
pub const BININT2          : u8 = b'M';    // 2-byte unsigned int
pub const BINPERSID        : u8 = b'Q';
pub const BINSTRING        : u8 = b'T';    // i32 length prefix
pub const SHORT_BINSTRING  : u8 = b'U';    // u8 length prefix
pub const BINUNICODE       : u8 = b'X';    // u32 length prefix, UTF-8
pub const EMPTY_DICT       : u8 = b'}';
pub const APPENDS          : u8 = b'e';
pub const BINGET           : u8 = b'h';
pub const LONG_BINGET      : u8 = b'j';
pub const EMPTY_LIST       : u8 = b']';
pub const OBJ              : u8 = b'o';    // class and args above mark
pub const BINPUT           : u8 = b'q';
pub const LONG_BINPUT      : u8 = b'r';
pub const SETITEMS         : u8 = b'u';
pub const EMPTY_TUPLE      : u8 = b')';

// Protocol 2.
pub const PROTO            : u8 = b'\x80';
pub const NEWOBJ           : u8 = b'\x81'; // cls.__new__(cls, *args)
pub const EXT1             : u8 = b'\x82';
pub const EXT2             : u8 = b'\x83';
pub const EXT4             : u8 = b'\x84';
pub const TUPLE1           : u8 = b'\x85';
pub const TUPLE2           : u8 = b'\x86';
pub const TUPLE3           : u8 = b'\x87';
pub const NEWTRUE          : u8 = b'\x88';
pub const NEWFALSE         : u8 = b'\x89';
pub const LONG1            : u8 = b'\x8a'; // u8 length, little-endian two's complement
pub const LONG4            : u8 = b'\x8b'; // i32 length, little-endian two's complement

// Protocol 3.
pub const BINBYTES         : u8 = b'B';
pub const SHORT_BINBYTES   : u8 = b'C';

// Protocol 4.
pub const SHORT_BINUNICODE : u8 = b'\x8c';
pub const BINUNICODE8      : u8 = b'\x8d';
pub const BINBYTES8        : u8 = b'\x8e';
pub const EMPTY_SET        : u8 = b'\x8f';
pub const ADDITEMS         : u8 = b'\x90';
pub const FROZENSET        : u8 = b'\x91';
pub const NEWOBJ_EX        : u8 = b'\x92'; // cls.__new__(cls, *args, **kwargs)
pub const STACK_GLOBAL     : u8 = b'\x93';
pub const MEMOIZE          : u8 = b'\x94';
pub const FRAME            : u8 = b'\x95';

// Protocol 5.
pub const BYTEARRAY8       : u8 = b'\x96';
pub const NEXT_BUFFER      : u8 = b'\x97';
pub const READONLY_BUFFER  : u8 = b'\x98';

/// Items per MARK batch when writing APPENDS/SETITEMS/ADDITEMS, as CPython does.
pub const BATCHSIZE: usize = 1000;
