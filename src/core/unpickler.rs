//! # Unpickler
//!
//! Stack-machine interpreter for the pickle format, protocols 0 through 5.
//!
//! Opcodes are read one at a time from a [`PickleRead`] source and executed
//! against an operand stack, a mark stack and a memo table. Instance creation
//! is delegated to the [`Registry`]; classes it does not know come back as
//! [`ClassDict`](crate::core::value::ClassDict) records.
//!
//! ## Guarantees
//! - Exactly the bytes of one pickled value are consumed, so several values
//!   can be read back to back from one source
//! - Unknown opcodes fail with the opcode byte and its offset
//! - Text is decoded strictly; invalid UTF-8 is an error, never replaced
//! - Memo ids are written at most once and must exist when fetched
//! - Containers nest at most [`MAX_RECURSION_DEPTH`] levels deep, the same
//!   limit the pickler enforces; tuples and frozensets are checked as they
//!   are built, the finished value once more before it is returned
//!
//! ## Example
//! ```rust
//! use pyro_wire::core::unpickler::loads;
//! use pyro_wire::core::value::Value;
//!
//! let value = loads(b"\x80\x02K\x2a.").unwrap();
//! assert_eq!(value, Value::Int(42));
//! ```

use crate::core::opcodes::*;
use crate::core::pickler::MAX_RECURSION_DEPTH;
use crate::core::reader::{PickleRead, SliceReader};
use crate::core::registry::Registry;
use crate::core::value::{ClassRef, Key, Shared, Value};
use crate::config::HIGHEST_PICKLE_PROTOCOL;
use crate::error::constants::{
    ERR_BAD_STOP, ERR_INVALID_MEMO_KEY, ERR_MEMO_OVERWRITE, ERR_NESTING_TOO_DEEP, ERR_NO_MARK,
    ERR_NO_PERSISTENT_LOAD, ERR_STACK_EMPTY,
};
use crate::error::{ProtocolError, Result};
use num_bigint::BigInt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Hook resolving persistent ids (PERSID / BINPERSID) to values.
pub type PersistentLoad = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Decode one value from `data` with the built-in registry.
pub fn loads(data: &[u8]) -> Result<Value> {
    Unpickler::new(default_registry()).loads(data)
}

/// Decode one value from `data` with a caller-supplied registry.
pub fn loads_with(data: &[u8], registry: Arc<Registry>) -> Result<Value> {
    Unpickler::new(registry).loads(data)
}

static DEFAULT_REGISTRY: once_cell::sync::Lazy<Arc<Registry>> =
    once_cell::sync::Lazy::new(|| Arc::new(Registry::default()));

/// The built-in registry, shared by every caller that does not bring its own.
pub fn default_registry() -> Arc<Registry> {
    Arc::clone(&DEFAULT_REGISTRY)
}

pub struct Unpickler {
    registry: Arc<Registry>,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
    /// Heights of the tuples and frozensets built by the current load.
    heights: HashMap<usize, usize>,
    buffers: VecDeque<Vec<u8>>,
    persistent_load: Option<PersistentLoad>,
}

impl Unpickler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            heights: HashMap::new(),
            buffers: VecDeque::new(),
            persistent_load: None,
        }
    }

    /// Out-of-band buffers consumed in order by NEXT_BUFFER.
    pub fn with_buffers<I>(mut self, buffers: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.buffers = buffers.into_iter().collect();
        self
    }

    pub fn with_persistent_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.persistent_load = Some(Box::new(hook));
        self
    }

    pub fn loads(&mut self, data: &[u8]) -> Result<Value> {
        self.load(&mut SliceReader::new(data))
    }

    /// Decode one value; the reader is left just past its STOP opcode.
    pub fn load<R: PickleRead>(&mut self, reader: &mut R) -> Result<Value> {
        self.reset();

        let start = reader.position();
        let result = self.run(reader).and_then(|value| {
            let depth = value.nesting_depth();
            if depth > MAX_RECURSION_DEPTH {
                return Err(ProtocolError::Decode(format!(
                    "{ERR_NESTING_TOO_DEEP} ({depth} > {MAX_RECURSION_DEPTH})"
                )));
            }
            Ok(value)
        });

        // no state leaks from one load into the next
        self.reset();

        if let Ok(value) = &result {
            trace!(
                bytes = reader.position() - start,
                kind = value.type_name(),
                "Unpickled value"
            );
        }
        result
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.marks.clear();
        self.memo.clear();
        self.heights.clear();
    }

    fn run<R: PickleRead>(&mut self, reader: &mut R) -> Result<Value> {
        loop {
            let opcode = reader.read_byte()?;
            if opcode == STOP {
                return self.finish();
            }
            self.dispatch(opcode, reader)?;
        }
    }

    fn finish(&mut self) -> Result<Value> {
        if self.stack.len() != 1 || !self.marks.is_empty() {
            return Err(ProtocolError::Decode(format!(
                "{ERR_BAD_STOP} (found {})",
                self.stack.len()
            )));
        }
        self.stack.pop().ok_or_else(|| ProtocolError::Decode(ERR_STACK_EMPTY.into()))
    }

    fn dispatch<R: PickleRead>(&mut self, opcode: u8, reader: &mut R) -> Result<()> {
        match opcode {
            PROTO => {
                let proto = reader.read_u8()?;
                if proto > HIGHEST_PICKLE_PROTOCOL {
                    return Err(ProtocolError::Decode(format!(
                        "unsupported pickle protocol: {proto}"
                    )));
                }
            }
            FRAME => {
                // frame boundaries carry no meaning for a sequential reader
                reader.read_u64_le()?;
            }
            MARK => self.marks.push(self.stack.len()),
            POP => {
                if self.marks.last() == Some(&self.stack.len()) {
                    self.marks.pop();
                } else {
                    self.pop()?;
                }
            }
            POP_MARK => {
                self.pop_mark()?;
            }
            DUP => {
                let top = self.peek()?.clone();
                self.stack.push(top);
            }

            NONE => self.stack.push(Value::None),
            NEWTRUE => self.stack.push(Value::Bool(true)),
            NEWFALSE => self.stack.push(Value::Bool(false)),
            INT => {
                let line = reader.read_line()?;
                let value = parse_int_line(&line)?;
                self.stack.push(value);
            }
            BININT => {
                let value = reader.read_i32_le()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            BININT1 => {
                let value = reader.read_u8()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            BININT2 => {
                let value = reader.read_u16_le()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            LONG => {
                let line = reader.read_line()?;
                let text = ascii_line(&line)?;
                let digits = text.strip_suffix('L').unwrap_or(text);
                let big = digits
                    .parse::<BigInt>()
                    .map_err(|e| ProtocolError::Decode(format!("invalid LONG literal {text:?}: {e}")))?;
                self.stack.push(Value::from_bigint(big));
            }
            LONG1 => {
                let len = usize::from(reader.read_u8()?);
                let bytes = reader.read_bytes(len)?;
                self.stack.push(Value::from_bigint(BigInt::from_signed_bytes_le(&bytes)));
            }
            LONG4 => {
                let len = non_negative(reader.read_i32_le()?, "LONG4")?;
                let bytes = reader.read_bytes(len)?;
                self.stack.push(Value::from_bigint(BigInt::from_signed_bytes_le(&bytes)));
            }
            FLOAT => {
                let line = reader.read_line()?;
                let text = ascii_line(&line)?;
                let value = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| ProtocolError::Decode(format!("invalid FLOAT literal {text:?}: {e}")))?;
                self.stack.push(Value::Float(value));
            }
            BINFLOAT => {
                let value = reader.read_f64_be()?;
                self.stack.push(Value::Float(value));
            }

            STRING => {
                let line = reader.read_line()?;
                let bytes = unquote_python_string(&line)?;
                self.stack.push(Value::String(latin1(&bytes)));
            }
            BINSTRING => {
                let len = non_negative(reader.read_i32_le()?, "BINSTRING")?;
                let bytes = reader.read_bytes(len)?;
                self.stack.push(Value::String(latin1(&bytes)));
            }
            SHORT_BINSTRING => {
                let len = usize::from(reader.read_u8()?);
                let bytes = reader.read_bytes(len)?;
                self.stack.push(Value::String(latin1(&bytes)));
            }
            UNICODE => {
                let line = reader.read_line()?;
                self.stack.push(Value::String(raw_unicode_escape(&line)?));
            }
            BINUNICODE => {
                let len = reader.read_u32_le()? as usize;
                let text = utf8(&reader.read_bytes(len)?)?;
                self.stack.push(Value::String(text));
            }
            SHORT_BINUNICODE => {
                let len = usize::from(reader.read_u8()?);
                let text = utf8(&reader.read_bytes(len)?)?;
                self.stack.push(Value::String(text));
            }
            BINUNICODE8 => {
                let len = length_u64(reader.read_u64_le()?)?;
                let text = utf8(&reader.read_bytes(len)?)?;
                self.stack.push(Value::String(text));
            }
            BINBYTES => {
                let len = reader.read_u32_le()? as usize;
                let bytes = reader.read_bytes(len)?.into_owned();
                self.stack.push(Value::Bytes(bytes));
            }
            SHORT_BINBYTES => {
                let len = usize::from(reader.read_u8()?);
                let bytes = reader.read_bytes(len)?.into_owned();
                self.stack.push(Value::Bytes(bytes));
            }
            BINBYTES8 => {
                let len = length_u64(reader.read_u64_le()?)?;
                let bytes = reader.read_bytes(len)?.into_owned();
                self.stack.push(Value::Bytes(bytes));
            }
            BYTEARRAY8 => {
                let len = length_u64(reader.read_u64_le()?)?;
                let bytes = reader.read_bytes(len)?.into_owned();
                self.stack.push(Value::ByteArray(bytes));
            }
            NEXT_BUFFER => {
                let buffer = self.buffers.pop_front().ok_or_else(|| {
                    ProtocolError::Decode("pickle stream refers to out-of-band data but no buffers were given".into())
                })?;
                self.stack.push(Value::Bytes(buffer));
            }
            READONLY_BUFFER => {
                self.peek()?;
            }

            EMPTY_LIST => self.stack.push(Value::list(Vec::new())),
            EMPTY_TUPLE => self.push_immutable(Value::tuple(Vec::new()), 1),
            EMPTY_DICT => self.stack.push(Value::dict(Vec::new())),
            EMPTY_SET => self.stack.push(Value::set(Vec::new())),
            LIST => {
                let items = self.pop_mark()?;
                self.stack.push(Value::list(items));
            }
            TUPLE => {
                let items = self.pop_mark()?;
                let height = self.height_above(&items)?;
                self.push_immutable(Value::tuple(items), height);
            }
            TUPLE1 | TUPLE2 | TUPLE3 => {
                let n = usize::from(opcode - TUPLE1 + 1);
                let items = self.pop_n(n)?;
                let height = self.height_above(&items)?;
                self.push_immutable(Value::tuple(items), height);
            }
            DICT => {
                let items = self.pop_mark()?;
                let dict = Shared::new(HashMap::new());
                insert_pairs(&dict, items)?;
                self.stack.push(Value::Dict(dict));
            }
            FROZENSET => {
                let items = self.pop_mark()?;
                let height = self.height_above(&items)?;
                let keys = items.iter().map(Value::to_key).collect::<Result<Vec<Key>>>()?;
                self.push_immutable(Value::frozenset(keys), height);
            }
            APPEND => {
                let item = self.pop()?;
                self.append_to_top(vec![item])?;
            }
            APPENDS => {
                let items = self.pop_mark()?;
                self.append_to_top(items)?;
            }
            SETITEM => {
                let value = self.pop()?;
                let key = self.pop()?;
                self.set_items_on_top(vec![key, value])?;
            }
            SETITEMS => {
                let items = self.pop_mark()?;
                self.set_items_on_top(items)?;
            }
            ADDITEMS => {
                let items = self.pop_mark()?;
                match self.peek()? {
                    Value::Set(set) => {
                        let mut set = set.write();
                        for item in &items {
                            set.insert(item.to_key()?);
                        }
                    }
                    other => {
                        return Err(ProtocolError::Decode(format!(
                            "ADDITEMS target is a {}, not a set",
                            other.type_name()
                        )))
                    }
                }
            }

            PUT => {
                let line = reader.read_line()?;
                let id = ascii_line(&line)?
                    .parse::<u32>()
                    .map_err(|_| ProtocolError::Decode(ERR_INVALID_MEMO_KEY.into()))?;
                self.memo_put(id)?;
            }
            BINPUT => {
                let id = u32::from(reader.read_u8()?);
                self.memo_put(id)?;
            }
            LONG_BINPUT => {
                let id = reader.read_u32_le()?;
                self.memo_put(id)?;
            }
            MEMOIZE => {
                let id = u32::try_from(self.memo.len())
                    .map_err(|_| ProtocolError::Decode(ERR_INVALID_MEMO_KEY.into()))?;
                self.memo_put(id)?;
            }
            GET => {
                let line = reader.read_line()?;
                let id = ascii_line(&line)?
                    .parse::<u32>()
                    .map_err(|_| ProtocolError::Decode(ERR_INVALID_MEMO_KEY.into()))?;
                self.memo_get(id)?;
            }
            BINGET => {
                let id = u32::from(reader.read_u8()?);
                self.memo_get(id)?;
            }
            LONG_BINGET => {
                let id = reader.read_u32_le()?;
                self.memo_get(id)?;
            }

            GLOBAL => {
                let module = utf8(&reader.read_line()?)?;
                let name = utf8(&reader.read_line()?)?;
                self.stack.push(Value::Class(ClassRef::new(module, name)));
            }
            STACK_GLOBAL => {
                let name = self.pop()?;
                let module = self.pop()?;
                match (module, name) {
                    (Value::String(module), Value::String(name)) => {
                        self.stack.push(Value::Class(ClassRef::new(module, name)));
                    }
                    _ => {
                        return Err(ProtocolError::Decode(
                            "STACK_GLOBAL requires str module and name".into(),
                        ))
                    }
                }
            }
            REDUCE => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let class = as_class(callable, "REDUCE")?;
                self.construct(&class, tuple_items(args, "REDUCE")?)?;
            }
            NEWOBJ => {
                let args = self.pop()?;
                let cls = self.pop()?;
                let class = as_class(cls, "NEWOBJ")?;
                self.construct(&class, tuple_items(args, "NEWOBJ")?)?;
            }
            NEWOBJ_EX => {
                let kwargs = self.pop()?;
                let args = self.pop()?;
                let cls = self.pop()?;
                let class = as_class(cls, "NEWOBJ_EX")?;
                let has_kwargs = match &kwargs {
                    Value::Dict(d) => !d.read().is_empty(),
                    Value::None => false,
                    _ => true,
                };
                if has_kwargs {
                    return Err(ProtocolError::Construct {
                        class: class.qualified(),
                        reason: "keyword arguments are not supported".into(),
                    });
                }
                self.construct(&class, tuple_items(args, "NEWOBJ_EX")?)?;
            }
            INST => {
                let module = utf8(&reader.read_line()?)?;
                let name = utf8(&reader.read_line()?)?;
                let args = self.pop_mark()?;
                self.construct(&ClassRef::new(module, name), args)?;
            }
            OBJ => {
                let mut items = self.pop_mark()?.into_iter();
                let cls = items
                    .next()
                    .ok_or_else(|| ProtocolError::Decode(ERR_STACK_EMPTY.into()))?;
                let class = as_class(cls, "OBJ")?;
                self.construct(&class, items.collect())?;
            }
            BUILD => {
                let state = self.pop()?;
                if !state.is_none() {
                    match self.peek()? {
                        Value::Object(record) => record.write().set_state(state)?,
                        // stateless natives such as time zones carry an empty dict
                        Value::Native(_) if matches!(&state, Value::Dict(d) if d.read().is_empty()) => {}
                        other => {
                            return Err(ProtocolError::Decode(format!(
                                "cannot apply BUILD state to a {}",
                                other.type_name()
                            )))
                        }
                    }
                }
            }

            PERSID => {
                let pid = Value::String(utf8(&reader.read_line()?)?);
                let value = self.persistent_load(pid)?;
                self.stack.push(value);
            }
            BINPERSID => {
                let pid = self.pop()?;
                let value = self.persistent_load(pid)?;
                self.stack.push(value);
            }
            EXT1 | EXT2 | EXT4 => {
                return Err(ProtocolError::Decode(format!(
                    "extension registry opcode 0x{opcode:02x} is not supported"
                )))
            }

            _ => {
                return Err(ProtocolError::UnknownOpcode {
                    opcode,
                    offset: reader.position() - 1,
                })
            }
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        if self.marks.last().is_some_and(|&mark| self.stack.len() <= mark) {
            return Err(ProtocolError::Decode(format!("{ERR_STACK_EMPTY} (crossed a mark)")));
        }
        self.stack
            .pop()
            .ok_or_else(|| ProtocolError::Decode(ERR_STACK_EMPTY.into()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() < floor + n {
            return Err(ProtocolError::Decode(ERR_STACK_EMPTY.into()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| ProtocolError::Decode(ERR_STACK_EMPTY.into()))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| ProtocolError::Decode(ERR_NO_MARK.into()))?;
        if mark > self.stack.len() {
            return Err(ProtocolError::Decode(ERR_NO_MARK.into()));
        }
        Ok(self.stack.split_off(mark))
    }

    fn height_of(&self, value: &Value) -> usize {
        match value {
            Value::Tuple(_) | Value::FrozenSet(_) => value
                .identity()
                .and_then(|addr| self.heights.get(&addr))
                .copied()
                .unwrap_or(1),
            _ => 0,
        }
    }

    /// Height of a new immutable container over `items`, refused past the limit.
    fn height_above(&self, items: &[Value]) -> Result<usize> {
        let height = 1 + items.iter().map(|item| self.height_of(item)).max().unwrap_or(0);
        if height > MAX_RECURSION_DEPTH {
            return Err(ProtocolError::Decode(format!(
                "{ERR_NESTING_TOO_DEEP} (more than {MAX_RECURSION_DEPTH})"
            )));
        }
        Ok(height)
    }

    fn push_immutable(&mut self, value: Value, height: usize) {
        if let (Value::Tuple(_) | Value::FrozenSet(_), Some(addr)) = (&value, value.identity()) {
            self.heights.insert(addr, height);
        }
        self.stack.push(value);
    }

    // A constructor may hand back a container built from its arguments.
    fn construct(&mut self, class: &ClassRef, args: Vec<Value>) -> Result<()> {
        let height = self.height_above(&args)?;
        let value = self.registry.construct(class, args)?;
        self.push_immutable(value, height);
        Ok(())
    }

    fn memo_put(&mut self, id: u32) -> Result<()> {
        let top = self.peek()?.clone();
        if self.memo.contains_key(&id) {
            return Err(ProtocolError::Decode(format!("{ERR_MEMO_OVERWRITE}: {id}")));
        }
        self.memo.insert(id, top);
        Ok(())
    }

    fn memo_get(&mut self, id: u32) -> Result<()> {
        let value = self
            .memo
            .get(&id)
            .cloned()
            .ok_or_else(|| ProtocolError::Decode(format!("{ERR_INVALID_MEMO_KEY}: {id}")))?;
        self.stack.push(value);
        Ok(())
    }

    fn append_to_top(&mut self, items: Vec<Value>) -> Result<()> {
        match self.peek()? {
            Value::List(list) => {
                list.write().extend(items);
                Ok(())
            }
            other => Err(ProtocolError::Decode(format!(
                "APPEND target is a {}, not a list",
                other.type_name()
            ))),
        }
    }

    fn set_items_on_top(&mut self, items: Vec<Value>) -> Result<()> {
        match self.peek()? {
            Value::Dict(dict) => insert_pairs(dict, items),
            other => Err(ProtocolError::Decode(format!(
                "SETITEM target is a {}, not a dict",
                other.type_name()
            ))),
        }
    }

    fn persistent_load(&self, pid: Value) -> Result<Value> {
        match &self.persistent_load {
            Some(hook) => hook(pid),
            None => Err(ProtocolError::Decode(ERR_NO_PERSISTENT_LOAD.into())),
        }
    }
}

fn insert_pairs(dict: &Shared<HashMap<Key, Value>>, items: Vec<Value>) -> Result<()> {
    if items.len() % 2 != 0 {
        return Err(ProtocolError::Decode("odd number of items for dict".into()));
    }
    let mut dict = dict.write();
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        dict.insert(key.to_key()?, value);
    }
    Ok(())
}

fn as_class(value: Value, opcode: &str) -> Result<ClassRef> {
    match value {
        Value::Class(class) => Ok(class),
        other => Err(ProtocolError::Decode(format!(
            "{opcode} expects a class on the stack, found {}",
            other.type_name()
        ))),
    }
}

fn tuple_items(args: Value, opcode: &str) -> Result<Vec<Value>> {
    match args {
        Value::Tuple(items) => Ok(Arc::try_unwrap(items).unwrap_or_else(|shared| shared.as_ref().clone())),
        Value::None => Ok(Vec::new()),
        other => Err(ProtocolError::Decode(format!(
            "{opcode} expects an argument tuple, found {}",
            other.type_name()
        ))),
    }
}

fn non_negative(len: i32, opcode: &str) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| ProtocolError::Decode(format!("{opcode} with negative length {len}")))
}

fn length_u64(len: u64) -> Result<usize> {
    usize::try_from(len).map_err(|_| ProtocolError::Decode(format!("length {len} exceeds address space")))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| ProtocolError::Decode(format!("invalid utf-8 text: {e}")))
}

fn ascii_line(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line).map_err(|_| ProtocolError::Decode("non-ascii numeric literal".into()))
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn parse_int_line(line: &[u8]) -> Result<Value> {
    match line {
        TRUE_LITERAL => return Ok(Value::Bool(true)),
        FALSE_LITERAL => return Ok(Value::Bool(false)),
        _ => {}
    }
    let text = ascii_line(line)?.trim();
    if let Ok(small) = text.parse::<i64>() {
        return Ok(Value::Int(small));
    }
    text.parse::<BigInt>()
        .map(Value::from_bigint)
        .map_err(|e| ProtocolError::Decode(format!("invalid INT literal {text:?}: {e}")))
}

/// Undo the Python 2 `repr()` quoting of a STRING operand.
fn unquote_python_string(line: &[u8]) -> Result<Vec<u8>> {
    let quoted = match line {
        [q @ (b'\'' | b'"'), inner @ .., end] if end == q => inner,
        _ => {
            return Err(ProtocolError::Decode(
                "the STRING opcode argument must be quoted".into(),
            ))
        }
    };

    let mut out = Vec::with_capacity(quoted.len());
    let mut i = 0;
    while i < quoted.len() {
        let b = quoted[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let esc = *quoted
            .get(i)
            .ok_or_else(|| ProtocolError::Decode("trailing backslash in STRING".into()))?;
        i += 1;
        match esc {
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'x' => {
                let hex = quoted
                    .get(i..i + 2)
                    .ok_or_else(|| ProtocolError::Decode("truncated \\x escape".into()))?;
                out.push(parse_hex(hex)? as u8);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut code = u32::from(esc - b'0');
                for _ in 0..2 {
                    match quoted.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            code = code * 8 + u32::from(d - b'0');
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push((code & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Decode a `raw-unicode-escape` line: latin-1 bytes plus `\uXXXX` / `\UXXXXXXXX`.
fn raw_unicode_escape(line: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let width = match (b, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => {
                out.push(char::from(b));
                i += 1;
                continue;
            }
        };
        let hex = line
            .get(i + 2..i + 2 + width)
            .ok_or_else(|| ProtocolError::Decode("truncated unicode escape".into()))?;
        let code = parse_hex(hex)?;
        let ch = char::from_u32(code)
            .ok_or_else(|| ProtocolError::Decode(format!("invalid code point U+{code:X}")))?;
        out.push(ch);
        i += 2 + width;
    }
    Ok(out)
}

fn parse_hex(digits: &[u8]) -> Result<u32> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| ProtocolError::Decode("invalid hex escape".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_protocol_bools_and_ints() {
        assert_eq!(loads(b"I01\n.").expect("true"), Value::Bool(true));
        assert_eq!(loads(b"I00\n.").expect("false"), Value::Bool(false));
        assert_eq!(loads(b"I-42\n.").expect("int"), Value::Int(-42));
    }

    #[test]
    fn test_long_text_literal_is_bigint() {
        let value = loads(b"L9999888877776666555544443333222211110000L\n.").expect("long");
        let expected: BigInt = "9999888877776666555544443333222211110000".parse().expect("bigint");
        assert_eq!(value, Value::BigInt(expected));
    }

    #[test]
    fn test_python2_strings_are_latin1() {
        assert_eq!(loads(b"S'Foobar'\n.").expect("str"), Value::from("Foobar"));
        assert_eq!(loads(b"S'\\xff'\n.").expect("str"), Value::from("\u{ff}"));
        assert_eq!(loads(b"U\x03\xe9t\xe9.").expect("short"), Value::from("\u{e9}t\u{e9}"));
    }

    #[test]
    fn test_raw_unicode_escape() {
        assert_eq!(loads(b"V\\u20ac\n.").expect("euro"), Value::from("\u{20ac}"));
        assert_eq!(
            loads(b"V\x07\xdb\x7f\x80\n.").expect("raw bytes"),
            Value::from("\u{07}\u{db}\u{7f}\u{80}")
        );
    }

    #[test]
    fn test_binunicode_strict_utf8() {
        assert_eq!(
            loads(b"X\x07\x00\x00\x00euro\xe2\x82\xac.").expect("utf8"),
            Value::from("euro\u{20ac}")
        );
        assert!(matches!(
            loads(b"X\x01\x00\x00\x00\xff."),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_opcode_offset() {
        match loads(b"\x80\x02\xff.") {
            Err(ProtocolError::UnknownOpcode { opcode, offset }) => {
                assert_eq!(opcode, 0xff);
                assert_eq!(offset, 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_stop_requires_single_value() {
        assert!(matches!(loads(b"."), Err(ProtocolError::Decode(_))));
        assert!(matches!(loads(b"NN."), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_memo_overwrite_and_missing() {
        assert!(matches!(loads(b"Nq\x00q\x00."), Err(ProtocolError::Decode(_))));
        assert!(matches!(loads(b"h\x05."), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_unsupported_proto_and_ext() {
        assert!(loads(b"\x80\x06N.").is_err());
        assert!(loads(b"\x82\x01.").is_err());
    }

    #[test]
    fn test_persistent_id_requires_hook() {
        assert!(matches!(loads(b"Pabc\n."), Err(ProtocolError::Decode(_))));
        let value = Unpickler::new(default_registry())
            .with_persistent_load(|pid| Ok(Value::tuple(vec![Value::from("loaded"), pid])))
            .loads(b"Pabc\n.")
            .expect("hooked");
        assert_eq!(
            value,
            Value::tuple(vec![Value::from("loaded"), Value::from("abc")])
        );
    }

    #[test]
    fn test_next_buffer_uses_supplied_buffers() {
        let value = Unpickler::new(default_registry())
            .with_buffers(vec![b"oob".to_vec()])
            .loads(b"\x80\x05\x97\x98.")
            .expect("buffer");
        assert_eq!(value, Value::Bytes(b"oob".to_vec()));
        assert!(loads(b"\x80\x05\x97.").is_err());
    }

    #[test]
    fn test_consumes_exactly_one_value() {
        let data = b"K\x01.K\x02.";
        let mut reader = SliceReader::new(data);
        let mut unpickler = Unpickler::new(default_registry());
        assert_eq!(unpickler.load(&mut reader).expect("first"), Value::Int(1));
        assert_eq!(unpickler.load(&mut reader).expect("second"), Value::Int(2));
    }
}
