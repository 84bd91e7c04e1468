//! # Pickler
//!
//! Encodes a [`Value`] graph into a pickle stream for protocols 2 through 5.
//!
//! Containers and records are memoized by identity, so a sub-object shared
//! by two parents is written once and fetched back with a memo GET, and
//! self-referencing graphs terminate. Scalars are always written by value.
//! Native values are lowered through the encoders of the [`Registry`] first;
//! a native type without an encoder is an error.
//!
//! Frames are not emitted. They are optional for readers of every protocol.

use crate::config::{DEFAULT_PICKLE_PROTOCOL, HIGHEST_PICKLE_PROTOCOL};
use crate::core::opcodes::*;
use crate::core::registry::Registry;
use crate::core::unpickler::default_registry;
use crate::core::value::{ClassDict, ClassRef, Key, Value};
use crate::error::constants::ERR_RECURSION_LIMIT;
use crate::error::{ProtocolError, Result};
use num_bigint::BigInt;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Lowest protocol the pickler writes.
pub const LOWEST_WRITE_PROTOCOL: u8 = 2;

/// Nesting depth at which encoding gives up.
pub const MAX_RECURSION_DEPTH: usize = 1000;

/// Items per APPENDS / SETITEMS / ADDITEMS batch.
const BATCH_SIZE: usize = 1000;

/// Encode `value` with the built-in registry.
pub fn dumps(value: &Value, protocol: u8) -> Result<Vec<u8>> {
    Pickler::new(default_registry(), protocol)?.dumps(value)
}

/// Encode `value` with a caller-supplied registry.
pub fn dumps_with(value: &Value, protocol: u8, registry: Arc<Registry>) -> Result<Vec<u8>> {
    Pickler::new(registry, protocol)?.dumps(value)
}

pub struct Pickler {
    registry: Arc<Registry>,
    protocol: u8,
    out: Vec<u8>,
    memo: HashMap<usize, u32>,
    // holds every memoized value so its address cannot be reused mid-pass
    keepalive: Vec<Value>,
    depth: usize,
}

impl Pickler {
    pub fn new(registry: Arc<Registry>, protocol: u8) -> Result<Self> {
        if !(LOWEST_WRITE_PROTOCOL..=HIGHEST_PICKLE_PROTOCOL).contains(&protocol) {
            return Err(ProtocolError::Encode(format!(
                "pickle protocol {protocol} is not supported for writing \
                 (use {LOWEST_WRITE_PROTOCOL}..={HIGHEST_PICKLE_PROTOCOL})"
            )));
        }
        Ok(Self {
            registry,
            protocol,
            out: Vec::new(),
            memo: HashMap::new(),
            keepalive: Vec::new(),
            depth: 0,
        })
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn dumps(&mut self, value: &Value) -> Result<Vec<u8>> {
        self.out.clear();
        self.memo.clear();
        self.keepalive.clear();
        self.depth = 0;

        self.out.push(PROTO);
        self.out.push(self.protocol);
        let written = self.save(value);

        self.memo.clear();
        self.keepalive.clear();
        written?;
        self.out.push(STOP);
        Ok(std::mem::take(&mut self.out))
    }

    pub fn dump<W: Write>(&mut self, value: &Value, writer: &mut W) -> Result<()> {
        let bytes = self.dumps(value)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn save(&mut self, value: &Value) -> Result<()> {
        if let Some(id) = value.identity().and_then(|addr| self.memo.get(&addr).copied()) {
            self.write_get(id);
            return Ok(());
        }

        self.depth += 1;
        if self.depth > MAX_RECURSION_DEPTH {
            self.depth -= 1;
            return Err(ProtocolError::Encode(ERR_RECURSION_LIMIT.into()));
        }
        let result = self.save_uncached(value);
        self.depth -= 1;
        result
    }

    fn save_uncached(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::None => self.out.push(NONE),
            Value::Bool(true) => self.out.push(NEWTRUE),
            Value::Bool(false) => self.out.push(NEWFALSE),
            Value::Int(i) => self.save_int(*i)?,
            Value::BigInt(big) => self.save_bigint(big)?,
            Value::Float(f) => {
                self.out.push(BINFLOAT);
                self.out.extend_from_slice(&f.to_be_bytes());
            }
            Value::String(s) => self.save_str(s)?,
            Value::Bytes(b) => self.save_bytes(b)?,
            Value::ByteArray(b) => self.save_bytearray(b)?,
            Value::Class(class) => self.save_global(class)?,
            Value::List(items) => {
                self.out.push(EMPTY_LIST);
                self.memoize(value)?;
                let items = items.read().clone();
                self.batch_appends(&items)?;
            }
            Value::Tuple(items) => self.save_tuple(value, items)?,
            Value::Dict(dict) => {
                self.out.push(EMPTY_DICT);
                self.memoize(value)?;
                let entries: Vec<(Key, Value)> = dict
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.batch_setitems(&entries)?;
            }
            Value::Set(members) => {
                let members: Vec<Key> = members.read().iter().cloned().collect();
                self.save_set(value, &members, "set")?;
            }
            Value::FrozenSet(members) => {
                let members: Vec<Key> = members.iter().cloned().collect();
                self.save_set(value, &members, "frozenset")?;
            }
            Value::Object(record) => {
                let record = record.read().clone();
                self.save_record(value, &record)?;
            }
            Value::Native(native) => {
                let lowered = self.registry.encode_native(native)?;
                self.keepalive.push(lowered.clone());
                self.save(&lowered)?;
            }
        }
        Ok(())
    }

    fn save_int(&mut self, i: i64) -> Result<()> {
        if (0..=0xff).contains(&i) {
            self.out.push(BININT1);
            self.out.push(i as u8);
        } else if (0..=0xffff).contains(&i) {
            self.out.push(BININT2);
            self.out.extend_from_slice(&(i as u16).to_le_bytes());
        } else if let Ok(small) = i32::try_from(i) {
            self.out.push(BININT);
            self.out.extend_from_slice(&small.to_le_bytes());
        } else {
            return self.save_bigint(&BigInt::from(i));
        }
        Ok(())
    }

    fn save_bigint(&mut self, big: &BigInt) -> Result<()> {
        let bytes = big.to_signed_bytes_le();
        if bytes.len() < 256 {
            self.out.push(LONG1);
            self.out.push(bytes.len() as u8);
        } else {
            self.out.push(LONG4);
            self.out.extend_from_slice(&length_u32(bytes.len(), "integer")?.to_le_bytes());
        }
        self.out.extend_from_slice(&bytes);
        Ok(())
    }

    fn save_str(&mut self, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        if self.protocol >= 4 && bytes.len() < 256 {
            self.out.push(SHORT_BINUNICODE);
            self.out.push(bytes.len() as u8);
        } else if self.protocol >= 4 && u32::try_from(bytes.len()).is_err() {
            self.out.push(BINUNICODE8);
            self.out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        } else {
            self.out.push(BINUNICODE);
            self.out.extend_from_slice(&length_u32(bytes.len(), "string")?.to_le_bytes());
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn save_bytes(&mut self, b: &[u8]) -> Result<()> {
        if self.protocol < 3 {
            // protocol 2 readers have no bytes opcode; rebuild through a reduce
            if b.is_empty() {
                self.save_global(&ClassRef::new("builtins", "bytes"))?;
                self.out.push(EMPTY_TUPLE);
            } else {
                self.save_global(&ClassRef::new("_codecs", "encode"))?;
                self.save_str(&latin1(b))?;
                self.save_str("latin1")?;
                self.out.push(TUPLE2);
            }
            self.out.push(REDUCE);
            return Ok(());
        }

        if b.len() < 256 {
            self.out.push(SHORT_BINBYTES);
            self.out.push(b.len() as u8);
        } else if self.protocol >= 4 && u32::try_from(b.len()).is_err() {
            self.out.push(BINBYTES8);
            self.out.extend_from_slice(&(b.len() as u64).to_le_bytes());
        } else {
            self.out.push(BINBYTES);
            self.out.extend_from_slice(&length_u32(b.len(), "bytes")?.to_le_bytes());
        }
        self.out.extend_from_slice(b);
        Ok(())
    }

    fn save_bytearray(&mut self, b: &[u8]) -> Result<()> {
        if self.protocol >= 5 {
            self.out.push(BYTEARRAY8);
            self.out.extend_from_slice(&(b.len() as u64).to_le_bytes());
            self.out.extend_from_slice(b);
            return Ok(());
        }
        self.save_global(&ClassRef::new("builtins", "bytearray"))?;
        if self.protocol < 3 {
            self.save_str(&latin1(b))?;
            self.save_str("latin-1")?;
            self.out.push(TUPLE2);
        } else {
            self.save_bytes(b)?;
            self.out.push(TUPLE1);
        }
        self.out.push(REDUCE);
        Ok(())
    }

    fn save_tuple(&mut self, value: &Value, items: &[Value]) -> Result<()> {
        if items.is_empty() {
            self.out.push(EMPTY_TUPLE);
            return Ok(());
        }

        let short = items.len() <= 3;
        if !short {
            self.out.push(MARK);
        }
        for item in items {
            self.save(item)?;
        }

        // an element referred back to this tuple: it is in the memo by now
        if let Some(id) = value.identity().and_then(|addr| self.memo.get(&addr).copied()) {
            if short {
                for _ in items {
                    self.out.push(POP);
                }
            } else {
                self.out.push(POP_MARK);
            }
            self.write_get(id);
            return Ok(());
        }

        self.out.push(match items.len() {
            1 => TUPLE1,
            2 => TUPLE2,
            3 => TUPLE3,
            _ => TUPLE,
        });
        self.memoize(value)?;
        Ok(())
    }

    fn save_set(&mut self, value: &Value, members: &[Key], kind: &str) -> Result<()> {
        let frozen = kind == "frozenset";
        if self.protocol < 4 {
            self.save_global(&ClassRef::new("builtins", kind))?;
            let items = Value::list(members.iter().cloned().map(Value::from).collect());
            self.keepalive.push(items.clone());
            self.save(&items)?;
            self.out.push(TUPLE1);
            self.out.push(REDUCE);
            self.memoize(value)?;
            return Ok(());
        }

        if frozen {
            self.out.push(MARK);
            for member in members {
                self.save_key(member)?;
            }
            if let Some(id) = value.identity().and_then(|addr| self.memo.get(&addr).copied()) {
                self.out.push(POP_MARK);
                self.write_get(id);
                return Ok(());
            }
            self.out.push(FROZENSET);
            self.memoize(value)?;
            return Ok(());
        }

        self.out.push(EMPTY_SET);
        self.memoize(value)?;
        for chunk in members.chunks(BATCH_SIZE) {
            self.out.push(MARK);
            for member in chunk {
                self.save_key(member)?;
            }
            self.out.push(ADDITEMS);
        }
        Ok(())
    }

    fn save_record(&mut self, value: &Value, record: &ClassDict) -> Result<()> {
        self.save_global(&record.class_ref())?;
        if record.args.is_empty() {
            self.out.push(EMPTY_TUPLE);
            self.out.push(NEWOBJ);
        } else {
            let args = Value::tuple(record.args.clone());
            self.keepalive.push(args.clone());
            self.save(&args)?;
            self.out.push(REDUCE);
        }
        self.memoize(value)?;

        let state = match &record.state {
            Some(state) => Some(state.clone()),
            None if !record.fields.is_empty() => Some(Value::dict(
                record
                    .fields
                    .iter()
                    .map(|(name, v)| (Key::String(name.clone()), v.clone())),
            )),
            None => None,
        };
        if let Some(state) = state {
            self.keepalive.push(state.clone());
            self.save(&state)?;
            self.out.push(BUILD);
        }
        Ok(())
    }

    fn save_global(&mut self, class: &ClassRef) -> Result<()> {
        if self.protocol >= 4 {
            self.save_str(&class.module)?;
            self.save_str(&class.name)?;
            self.out.push(STACK_GLOBAL);
            return Ok(());
        }

        let module = match class.module.as_str() {
            "builtins" if self.protocol < 3 => "__builtin__",
            "copyreg" if self.protocol < 3 => "copy_reg",
            other => other,
        };
        if module.contains('\n') || class.name.contains('\n') {
            return Err(ProtocolError::Encode(format!("invalid global name {class}")));
        }
        self.out.push(GLOBAL);
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(class.name.as_bytes());
        self.out.push(b'\n');
        Ok(())
    }

    fn save_key(&mut self, key: &Key) -> Result<()> {
        let value = Value::from(key.clone());
        if value.identity().is_some() {
            self.keepalive.push(value.clone());
        }
        self.save(&value)
    }

    fn batch_appends(&mut self, items: &[Value]) -> Result<()> {
        for chunk in items.chunks(BATCH_SIZE) {
            if let [single] = chunk {
                self.save(single)?;
                self.out.push(APPEND);
                continue;
            }
            self.out.push(MARK);
            for item in chunk {
                self.save(item)?;
            }
            self.out.push(APPENDS);
        }
        Ok(())
    }

    fn batch_setitems(&mut self, entries: &[(Key, Value)]) -> Result<()> {
        for chunk in entries.chunks(BATCH_SIZE) {
            if let [(key, value)] = chunk {
                self.save_key(key)?;
                self.save(value)?;
                self.out.push(SETITEM);
                continue;
            }
            self.out.push(MARK);
            for (key, value) in chunk {
                self.save_key(key)?;
                self.save(value)?;
            }
            self.out.push(SETITEMS);
        }
        Ok(())
    }

    fn memoize(&mut self, value: &Value) -> Result<()> {
        let Some(addr) = value.identity() else {
            return Ok(());
        };
        let id = length_u32(self.memo.len(), "memo")?;
        self.memo.insert(addr, id);
        self.keepalive.push(value.clone());

        if self.protocol >= 4 {
            self.out.push(MEMOIZE);
        } else if id < 256 {
            self.out.push(BINPUT);
            self.out.push(id as u8);
        } else {
            self.out.push(LONG_BINPUT);
            self.out.extend_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }

    fn write_get(&mut self, id: u32) {
        if id < 256 {
            self.out.push(BINGET);
            self.out.push(id as u8);
        } else {
            self.out.push(LONG_BINGET);
            self.out.extend_from_slice(&id.to_le_bytes());
        }
    }
}

impl Default for Pickler {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            protocol: DEFAULT_PICKLE_PROTOCOL,
            out: Vec::new(),
            memo: HashMap::new(),
            keepalive: Vec::new(),
            depth: 0,
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// Protocols below 4 carry lengths and memo ids in four bytes.
fn length_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        ProtocolError::Encode(format!("{what} too large for a 4-byte length: {len}"))
    })
}
