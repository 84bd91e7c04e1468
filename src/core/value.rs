//! # Value Model
//!
//! The native shape of everything the pickle codec decodes or encodes.
//!
//! Mutable containers (`list`, `dict`, `set`, class records) live behind
//! [`Shared`] handles so that a decoded graph keeps the identity of shared
//! sub-objects and may contain cycles. Immutable containers (`tuple`,
//! `frozenset`) use a plain `Arc`. Identity is the allocation address in both
//! cases, which is what the encoder memo keys on.
//!
//! Dictionary keys and set members are restricted to the hashable subset,
//! represented by [`Key`].

use crate::error::{ProtocolError, Result};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Mapping with hashable keys (`dict`).
pub type Dict = HashMap<Key, Value>;

/// Set of hashable members (`set` / `frozenset`).
pub type KeySet = HashSet<Key>;

/// Reference-counted, interior-mutable handle with identity semantics.
///
/// Dropping the last handle tears the contents down with an explicit work
/// list, so arbitrarily deep graphs of lists, dicts, sets and records do not
/// recurse on drop.
pub struct Shared<T: Release>(Arc<RwLock<T>>);

impl<T: Release> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Read access. A poisoned lock still yields the data.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access. A poisoned lock still yields the data.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the shared allocation, stable for the object's lifetime.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Move the contents out when this is the last handle; the emptied shell
    /// then drops without recursing.
    fn release_into(mut self, values: &mut Vec<Value>, keys: &mut Vec<Key>) {
        if let Some(lock) = Arc::get_mut(&mut self.0) {
            lock.get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .release(values, keys);
        }
    }
}

impl<T: Release> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Release> Drop for Shared<T> {
    fn drop(&mut self) {
        let Some(lock) = Arc::get_mut(&mut self.0) else {
            return;
        };
        let (mut values, mut keys) = (Vec::new(), Vec::new());
        lock.get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&mut values, &mut keys);
        if !values.is_empty() || !keys.is_empty() {
            drop_flat(values, keys);
        }
    }
}

/// Contents a [`Shared`] handle hands back when its last owner goes away.
pub trait Release {
    /// Move every nested value and key out of `self`.
    fn release(&mut self, values: &mut Vec<Value>, keys: &mut Vec<Key>);
}

impl Release for Vec<Value> {
    fn release(&mut self, values: &mut Vec<Value>, _keys: &mut Vec<Key>) {
        values.append(self);
    }
}

impl Release for Dict {
    fn release(&mut self, values: &mut Vec<Value>, keys: &mut Vec<Key>) {
        for (key, value) in self.drain() {
            keys.push(key);
            values.push(value);
        }
    }
}

impl Release for KeySet {
    fn release(&mut self, _values: &mut Vec<Value>, keys: &mut Vec<Key>) {
        keys.extend(self.drain());
    }
}

impl Release for ClassDict {
    fn release(&mut self, values: &mut Vec<Value>, _keys: &mut Vec<Key>) {
        values.append(&mut self.args);
        values.extend(std::mem::take(&mut self.fields).into_values());
        values.extend(self.state.take());
    }
}

// Unique tuples and frozensets are unpacked here too; shared ones only lose a count.
fn drop_flat(mut values: Vec<Value>, mut keys: Vec<Key>) {
    loop {
        if let Some(value) = values.pop() {
            match value {
                Value::List(list) => list.release_into(&mut values, &mut keys),
                Value::Dict(dict) => dict.release_into(&mut values, &mut keys),
                Value::Set(set) => set.release_into(&mut values, &mut keys),
                Value::Object(record) => record.release_into(&mut values, &mut keys),
                Value::Tuple(items) => {
                    if let Ok(items) = Arc::try_unwrap(items) {
                        values.extend(items);
                    }
                }
                Value::FrozenSet(members) => {
                    if let Ok(members) = Arc::try_unwrap(members) {
                        keys.extend(members);
                    }
                }
                _ => {}
            }
        } else if let Some(key) = keys.pop() {
            match key {
                Key::Tuple(items) => keys.extend(items),
                Key::FrozenSet(members) => {
                    if let Ok(members) = Arc::try_unwrap(members) {
                        keys.extend(members);
                    }
                }
                _ => {}
            }
        } else {
            return;
        }
    }
}

/// A `module.name` pair naming a remote class or function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    pub module: String,
    pub name: String,
}

impl ClassRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Dotted qualified name, e.g. `Pyro4.errors.CommunicationError`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Record of an instance whose class has no local counterpart.
///
/// `args` holds the positional constructor arguments, `fields` the merged
/// instance dictionary, and `state` any state value that was not a mapping
/// (for example the tuple a Pyro URI pickles itself as).
#[derive(Clone, Default)]
pub struct ClassDict {
    class_name: String,
    pub args: Vec<Value>,
    pub fields: BTreeMap<String, Value>,
    pub state: Option<Value>,
}

impl ClassDict {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    pub fn with_args(class_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class_name: class_name.into(),
            args,
            ..Self::default()
        }
    }

    /// Qualified name of the remote class.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The `(module, name)` split of the qualified class name.
    pub fn class_ref(&self) -> ClassRef {
        match self.class_name.rsplit_once('.') {
            Some((module, name)) => ClassRef::new(module, name),
            None => ClassRef::new("", self.class_name.as_str()),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Apply a BUILD state value.
    ///
    /// A mapping is merged into `fields`. A `(mapping | None, mapping)` pair
    /// merges both halves. `None` is a no-op. Anything else is kept in `state`.
    pub fn set_state(&mut self, state: Value) -> Result<()> {
        match &state {
            Value::None => Ok(()),
            Value::Dict(dict) => self.merge_fields(&dict.read()),
            Value::Tuple(items) if items.len() == 2 && is_slot_state(items) => {
                for half in items.iter() {
                    if let Value::Dict(dict) = half {
                        self.merge_fields(&dict.read())?;
                    }
                }
                Ok(())
            }
            _ => {
                self.state = Some(state);
                Ok(())
            }
        }
    }

    fn merge_fields(&mut self, dict: &Dict) -> Result<()> {
        for (key, value) in dict {
            let Key::String(name) = key else {
                return Err(ProtocolError::Decode(format!(
                    "state key for {} is not a string: {key:?}",
                    self.class_name
                )));
            };
            self.fields.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

fn is_slot_state(items: &[Value]) -> bool {
    matches!(items[0], Value::None | Value::Dict(_)) && matches!(items[1], Value::None | Value::Dict(_))
}

/// Opaque native object carried through a [`Value`] until an encoder turns
/// it into a base shape.
#[derive(Clone)]
pub struct NativeValue {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl NativeValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn native_type_id(&self) -> TypeId {
        Any::type_id(&*self.inner)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// Hashable subset of [`Value`], usable as a dict key or set member.
#[derive(Clone)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    Tuple(Vec<Key>),
    FrozenSet(Arc<KeySet>),
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::None, Key::None) => true,
            (Key::Bool(a), Key::Bool(b)) => a == b,
            (Key::Int(a), Key::Int(b)) => a == b,
            (Key::BigInt(a), Key::BigInt(b)) => a == b,
            (Key::Float(a), Key::Float(b)) => a.to_bits() == b.to_bits(),
            (Key::Bytes(a), Key::Bytes(b)) => a == b,
            (Key::String(a), Key::String(b)) => a == b,
            (Key::Tuple(a), Key::Tuple(b)) => a == b,
            (Key::FrozenSet(a), Key::FrozenSet(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Key::None => {}
            Key::Bool(b) => b.hash(state),
            Key::Int(i) => i.hash(state),
            Key::BigInt(b) => b.hash(state),
            Key::Float(f) => f.to_bits().hash(state),
            Key::Bytes(b) => b.hash(state),
            Key::String(s) => s.hash(state),
            Key::Tuple(items) => items.hash(state),
            Key::FrozenSet(members) => {
                // order independent
                let mut combined = 0u64;
                for member in members.iter() {
                    let mut h = DefaultHasher::new();
                    member.hash(&mut h);
                    combined = combined.wrapping_add(h.finish());
                }
                members.len().hash(state);
                combined.hash(state);
            }
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::from(self.clone()), f)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

fn key_height(key: &Key, memo: &mut HashMap<usize, usize>) -> usize {
    match key {
        Key::Tuple(items) => 1 + items.iter().map(|k| key_height(k, memo)).max().unwrap_or(0),
        Key::FrozenSet(members) => {
            let addr = Arc::as_ptr(members) as *const () as usize;
            if let Some(&height) = memo.get(&addr) {
                return height;
            }
            let height = 1 + members.iter().map(|k| key_height(k, memo)).max().unwrap_or(0);
            memo.insert(addr, height);
            height
        }
        _ => 0,
    }
}

/// Every shape the codec can decode or encode.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    /// Integers that fit in 64 bits.
    Int(i64),
    /// Integers outside the `i64` range; never holds a value that fits `Int`.
    BigInt(BigInt),
    Float(f64),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    String(String),
    List(Shared<Vec<Value>>),
    Tuple(Arc<Vec<Value>>),
    Dict(Shared<Dict>),
    Set(Shared<KeySet>),
    FrozenSet(Arc<KeySet>),
    Object(Shared<ClassDict>),
    Class(ClassRef),
    Native(NativeValue),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Shared::new(items))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(items))
    }

    pub fn dict<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Key, Value)>,
    {
        Value::Dict(Shared::new(entries.into_iter().collect()))
    }

    pub fn set<I>(members: I) -> Self
    where
        I: IntoIterator<Item = Key>,
    {
        Value::Set(Shared::new(members.into_iter().collect()))
    }

    pub fn frozenset<I>(members: I) -> Self
    where
        I: IntoIterator<Item = Key>,
    {
        Value::FrozenSet(Arc::new(members.into_iter().collect()))
    }

    pub fn object(record: ClassDict) -> Self {
        Value::Object(Shared::new(record))
    }

    pub fn native<T: Any + Send + Sync>(value: T) -> Self {
        Value::Native(NativeValue::new(value))
    }

    /// Normalizes to `Int` when the value fits in 64 bits.
    pub fn from_bigint(big: BigInt) -> Self {
        match big.to_i64() {
            Some(small) => Value::Int(small),
            None => Value::BigInt(big),
        }
    }

    /// Python-style type name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::ByteArray(_) => "bytearray",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Object(_) => "object",
            Value::Class(_) => "class",
            Value::Native(_) => "native",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) | Value::ByteArray(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Native(native) => native.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Snapshot of the elements of any sequence or set shape.
    pub fn elements(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.read().clone()),
            Value::Tuple(items) => Some(items.as_ref().clone()),
            Value::Set(members) => Some(members.read().iter().cloned().map(Value::from).collect()),
            Value::FrozenSet(members) => Some(members.iter().cloned().map(Value::from).collect()),
            _ => None,
        }
    }

    /// Look up a string key in a dict value.
    pub fn get_item(&self, key: &str) -> Option<Value> {
        match self {
            Value::Dict(dict) => dict.read().get(&Key::from(key)).cloned(),
            _ => None,
        }
    }

    /// Identity of a container or record; `None` for scalars.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::List(s) => Some(s.addr()),
            Value::Dict(s) => Some(s.addr()),
            Value::Set(s) => Some(s.addr()),
            Value::Object(s) => Some(s.addr()),
            Value::Tuple(t) => Some(Arc::as_ptr(t) as *const () as usize),
            Value::FrozenSet(t) => Some(Arc::as_ptr(t) as *const () as usize),
            _ => None,
        }
    }

    /// Longest chain of nested containers, counting `self`; scalars are 0.
    ///
    /// Walks the graph with an explicit stack. Shared sub-objects are
    /// measured once and a back-reference into a cycle counts as a leaf.
    /// Native values are opaque and count as scalars.
    pub fn nesting_depth(&self) -> usize {
        enum Step {
            Enter(Value),
            Leave(usize, Vec<usize>, usize),
        }

        let mut heights: HashMap<usize, usize> = HashMap::new();
        let mut open: HashSet<usize> = HashSet::new();
        let mut steps = vec![Step::Enter(self.clone())];

        while let Some(step) = steps.pop() {
            match step {
                Step::Enter(value) => {
                    let Some(addr) = value.identity() else {
                        continue;
                    };
                    if heights.contains_key(&addr) || !open.insert(addr) {
                        continue;
                    }
                    let (children, key_height) = value.nested(&mut heights);
                    let addrs = children.iter().filter_map(Value::identity).collect();
                    steps.push(Step::Leave(addr, addrs, key_height));
                    steps.extend(children.into_iter().map(Step::Enter));
                }
                Step::Leave(addr, children, key_height) => {
                    let below = children
                        .iter()
                        .filter_map(|child| heights.get(child))
                        .copied()
                        .max()
                        .unwrap_or(0)
                        .max(key_height);
                    heights.insert(addr, below + 1);
                    open.remove(&addr);
                }
            }
        }

        self.identity()
            .and_then(|addr| heights.get(&addr))
            .copied()
            .unwrap_or(0)
    }

    // Container children plus the height of any keys held directly.
    fn nested(&self, memo: &mut HashMap<usize, usize>) -> (Vec<Value>, usize) {
        fn containers<'a>(items: impl Iterator<Item = &'a Value>) -> Vec<Value> {
            items.filter(|v| v.identity().is_some()).cloned().collect()
        }
        fn tallest<'a>(keys: impl Iterator<Item = &'a Key>, memo: &mut HashMap<usize, usize>) -> usize {
            keys.map(|key| key_height(key, memo)).max().unwrap_or(0)
        }

        match self {
            Value::List(items) => (containers(items.read().iter()), 0),
            Value::Tuple(items) => (containers(items.iter()), 0),
            Value::Dict(dict) => {
                let dict = dict.read();
                (containers(dict.values()), tallest(dict.keys(), memo))
            }
            Value::Set(members) => (Vec::new(), tallest(members.read().iter(), memo)),
            Value::FrozenSet(members) => (Vec::new(), tallest(members.iter(), memo)),
            Value::Object(record) => {
                let record = record.read();
                let items = record
                    .args
                    .iter()
                    .chain(record.fields.values())
                    .chain(record.state.iter());
                (containers(items), 0)
            }
            _ => (Vec::new(), 0),
        }
    }

    /// Convert into a hashable key; mutable containers are rejected.
    pub fn to_key(&self) -> Result<Key> {
        Ok(match self {
            Value::None => Key::None,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::BigInt(b) => Key::BigInt(b.clone()),
            Value::Float(f) => Key::Float(*f),
            Value::Bytes(b) => Key::Bytes(b.clone()),
            Value::String(s) => Key::String(s.clone()),
            Value::Tuple(items) => Key::Tuple(
                items
                    .iter()
                    .map(Value::to_key)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::FrozenSet(members) => Key::FrozenSet(Arc::clone(members)),
            other => {
                return Err(ProtocolError::Decode(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(b),
            Key::Int(i) => Value::Int(i),
            Key::BigInt(b) => Value::BigInt(b),
            Key::Float(f) => Value::Float(f),
            Key::Bytes(b) => Value::Bytes(b),
            Key::String(s) => Value::String(s),
            Key::Tuple(items) => Value::tuple(items.into_iter().map(Value::from).collect()),
            Key::FrozenSet(members) => Value::FrozenSet(members),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<BigInt> for Value {
    fn from(b: BigInt) -> Self {
        Value::from_bigint(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::None, Into::into)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let mut visiting = Vec::new();
        values_equal(self, other, &mut visiting)
    }
}

// Pairs already under comparison are treated as equal, so cyclic graphs terminate.
fn values_equal(a: &Value, b: &Value, visiting: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::ByteArray(x), Value::ByteArray(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Class(x), Value::Class(y)) => x == y,
        (Value::Native(x), Value::Native(y)) => x.addr() == y.addr(),
        (Value::Tuple(x), Value::Tuple(y)) => {
            Arc::ptr_eq(x, y) || sequences_equal(x, y, visiting)
        }
        (Value::FrozenSet(x), Value::FrozenSet(y)) => Arc::ptr_eq(x, y) || x == y,
        (Value::Set(x), Value::Set(y)) => x.ptr_eq(y) || *x.read() == *y.read(),
        (Value::List(x), Value::List(y)) => {
            guarded(x.addr(), y.addr(), visiting, |visiting| {
                sequences_equal(&x.read(), &y.read(), visiting)
            })
        }
        (Value::Dict(x), Value::Dict(y)) => guarded(x.addr(), y.addr(), visiting, |visiting| {
            let (x, y) = (x.read(), y.read());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(k)
                        .map(|other| values_equal(v, other, visiting))
                        .unwrap_or(false)
                })
        }),
        (Value::Object(x), Value::Object(y)) => guarded(x.addr(), y.addr(), visiting, |visiting| {
            let (x, y) = (x.read(), y.read());
            x.class_name == y.class_name
                && sequences_equal(&x.args, &y.args, visiting)
                && x.fields.len() == y.fields.len()
                && x.fields.iter().zip(y.fields.iter()).all(|((ka, va), (kb, vb))| {
                    ka == kb && values_equal(va, vb, visiting)
                })
                && match (&x.state, &y.state) {
                    (None, None) => true,
                    (Some(sa), Some(sb)) => values_equal(sa, sb, visiting),
                    _ => false,
                }
        }),
        _ => false,
    }
}

fn sequences_equal(x: &[Value], y: &[Value], visiting: &mut Vec<(usize, usize)>) -> bool {
    x.len() == y.len()
        && x
            .iter()
            .zip(y.iter())
            .all(|(a, b)| values_equal(a, b, visiting))
}

fn guarded<F>(a: usize, b: usize, visiting: &mut Vec<(usize, usize)>, compare: F) -> bool
where
    F: FnOnce(&mut Vec<(usize, usize)>) -> bool,
{
    if a == b || visiting.contains(&(a, b)) {
        return true;
    }
    visiting.push((a, b));
    let equal = compare(visiting);
    visiting.pop();
    equal
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut active = Vec::new();
        write_repr(self, f, &mut active)
    }
}

// Python-flavoured repr; a container already being printed shows as `[...]` / `{...}`.
fn write_repr(value: &Value, f: &mut fmt::Formatter<'_>, active: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::None => f.write_str("None"),
        Value::Bool(true) => f.write_str("True"),
        Value::Bool(false) => f.write_str("False"),
        Value::Int(i) => write!(f, "{i}"),
        Value::BigInt(b) => write!(f, "{b}"),
        Value::Float(x) => write!(f, "{x:?}"),
        Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
        Value::ByteArray(b) => write!(f, "bytearray(b{:?})", String::from_utf8_lossy(b)),
        Value::String(s) => write!(f, "{s:?}"),
        Value::Class(c) => write!(f, "<class '{c}'>"),
        Value::Native(n) => write!(f, "<native {}>", n.type_name()),
        Value::Tuple(items) => {
            f.write_str("(")?;
            write_items(items.iter(), f, active)?;
            if items.len() == 1 {
                f.write_str(",")?;
            }
            f.write_str(")")
        }
        Value::FrozenSet(members) => {
            f.write_str("frozenset({")?;
            write_items(members.iter().cloned().map(Value::from).collect::<Vec<_>>().iter(), f, active)?;
            f.write_str("})")
        }
        Value::Set(members) => {
            let members: Vec<Value> = members.read().iter().cloned().map(Value::from).collect();
            if members.is_empty() {
                return f.write_str("set()");
            }
            f.write_str("{")?;
            write_items(members.iter(), f, active)?;
            f.write_str("}")
        }
        Value::List(items) => {
            if active.contains(&items.addr()) {
                return f.write_str("[...]");
            }
            active.push(items.addr());
            f.write_str("[")?;
            write_items(items.read().iter(), f, active)?;
            active.pop();
            f.write_str("]")
        }
        Value::Dict(dict) => {
            if active.contains(&dict.addr()) {
                return f.write_str("{...}");
            }
            active.push(dict.addr());
            f.write_str("{")?;
            for (i, (k, v)) in dict.read().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_repr(&Value::from(k.clone()), f, active)?;
                f.write_str(": ")?;
                write_repr(v, f, active)?;
            }
            active.pop();
            f.write_str("}")
        }
        Value::Object(record) => {
            if active.contains(&record.addr()) {
                return f.write_str("<...>");
            }
            active.push(record.addr());
            let record_ref = record.read();
            write!(f, "{}(", record_ref.class_name)?;
            write_items(record_ref.args.iter(), f, active)?;
            for (i, (name, v)) in record_ref.fields.iter().enumerate() {
                if i > 0 || !record_ref.args.is_empty() {
                    f.write_str(", ")?;
                }
                write!(f, "{name}=")?;
                write_repr(v, f, active)?;
            }
            if let Some(state) = &record_ref.state {
                f.write_str("; state=")?;
                write_repr(state, f, active)?;
            }
            active.pop();
            f.write_str(")")
        }
    }
}

fn write_items<'a, I>(items: I, f: &mut fmt::Formatter<'_>, active: &mut Vec<usize>) -> fmt::Result
where
    I: Iterator<Item = &'a Value>,
{
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_repr(item, f, active)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigint_normalization() {
        assert!(matches!(Value::from_bigint(BigInt::from(42)), Value::Int(42)));
        let big = BigInt::from(i64::MAX) + 1;
        assert!(matches!(Value::from_bigint(big), Value::BigInt(_)));
    }

    #[test]
    fn test_unhashable_key_rejected() {
        let list = Value::list(vec![Value::Int(1)]);
        assert!(matches!(list.to_key(), Err(ProtocolError::Decode(_))));
        let tuple = Value::tuple(vec![Value::Int(1), list]);
        assert!(tuple.to_key().is_err());
    }

    #[test]
    fn test_frozenset_key_hash_is_order_independent() {
        let a = Key::FrozenSet(Arc::new([Key::Int(1), Key::Int(2)].into_iter().collect()));
        let b = Key::FrozenSet(Arc::new([Key::Int(2), Key::Int(1)].into_iter().collect()));
        let mut set = KeySet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_cyclic_list_debug_and_eq_terminate() {
        let list = Shared::new(Vec::new());
        let value = Value::List(list.clone());
        list.write().push(value.clone());
        assert_eq!(format!("{value:?}"), "[[...]]");
        assert_eq!(value, value.clone());
    }

    #[test]
    fn test_set_state_merges_mapping_and_slots() {
        let mut record = ClassDict::new("mod.Thing");
        let dict = Value::dict([(Key::from("a"), Value::Int(1))]);
        let slots = Value::dict([(Key::from("b"), Value::Int(2))]);
        record
            .set_state(Value::tuple(vec![dict, slots]))
            .expect("slot state");
        assert_eq!(record.get("a"), Some(&Value::Int(1)));
        assert_eq!(record.get("b"), Some(&Value::Int(2)));
        assert!(record.state.is_none());

        record
            .set_state(Value::tuple(vec![Value::from("PYRO"), Value::Int(1), Value::Int(2)]))
            .expect("opaque state");
        assert!(record.state.is_some());
    }

    #[test]
    fn test_deep_graph_drops_without_recursing() {
        let mut value = Value::None;
        for i in 0..300_000 {
            value = match i % 3 {
                0 => Value::list(vec![value]),
                1 => Value::dict([(Key::Int(i), value)]),
                _ => {
                    let mut record = ClassDict::new("mod.Node");
                    record.fields.insert("next".into(), value);
                    Value::object(record)
                }
            };
        }
        drop(value);
    }

    #[test]
    fn test_nesting_depth() {
        assert_eq!(Value::Int(1).nesting_depth(), 0);
        let inner = Value::list(vec![Value::Int(1)]);
        let shared = Value::tuple(vec![inner.clone(), Value::dict([(Key::from("k"), inner)])]);
        assert_eq!(shared.nesting_depth(), 3);

        let key = Key::Tuple(vec![Key::Tuple(vec![Key::Int(1)])]);
        assert_eq!(Value::set([key]).nesting_depth(), 3);

        let list = Shared::new(Vec::new());
        let cyclic = Value::List(list.clone());
        list.write().push(cyclic.clone());
        assert_eq!(cyclic.nesting_depth(), 1);
        list.write().clear();
    }

    #[test]
    fn test_class_ref_split() {
        let record = ClassDict::new("Pyro4.errors.CommunicationError");
        assert_eq!(
            record.class_ref(),
            ClassRef::new("Pyro4.errors", "CommunicationError")
        );
    }
}
