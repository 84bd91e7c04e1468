//! Built-in reflective factories: the Python builtins that show up in
//! pickles written by CPython and Pyro daemons, plus the exception rule.
//! Standard-library types register from [`stdlib`].

use crate::core::registry::{Registry, RegistryBuilder};
use crate::core::stdlib;
use crate::core::value::{ClassDict, ClassRef, Key, Value};
use crate::protocol::proxy_ref::ProxyRef;
use crate::protocol::remote_error::RemoteError;
use crate::protocol::uri::PyroUri;

type FactoryResult = std::result::Result<Value, String>;

/// Python 2 and 3 spellings of the builtins module.
const BUILTIN_MODULES: [&str; 2] = ["builtins", "__builtin__"];

/// Builtin exception names that do not follow the `*Error` convention.
const SPECIAL_EXCEPTIONS: [&str; 5] = [
    "StopIteration",
    "StopAsyncIteration",
    "GeneratorExit",
    "KeyboardInterrupt",
    "SystemExit",
];

pub(crate) fn install_builtins(builder: &mut RegistryBuilder) {
    for module in BUILTIN_MODULES {
        builder.add_factory(&format!("{module}.set"), set);
        builder.add_factory(&format!("{module}.frozenset"), frozenset);
        builder.add_factory(&format!("{module}.bytearray"), bytearray);
        builder.add_factory(&format!("{module}.bytes"), bytes);
        builder.add_factory(&format!("{module}.object"), object);
    }
    builder.add_factory("_codecs.encode", codecs_encode);
    builder.add_factory("copy_reg._reconstructor", reconstructor);
    builder.add_factory("copyreg._reconstructor", reconstructor);
    builder.add_factory("collections.OrderedDict", ordered_dict);
    builder.add_factory("Pyro4.core.URI", pyro_uri);

    builder.add_encoder(|uri: &PyroUri| Ok(uri.to_value()));
    builder.add_encoder(|err: &RemoteError| Ok(err.to_value()));
    builder.add_encoder(|proxy: &ProxyRef| Ok(proxy.to_value()));

    stdlib::install(builder);
}

/// Whether `module.name` names an exception class by convention.
pub fn is_exception_class(module: &str, name: &str) -> bool {
    match module {
        "Pyro4.errors" | "exceptions" => true,
        m if BUILTIN_MODULES.contains(&m) => {
            name.ends_with("Error")
                || name.ends_with("Warning")
                || name.ends_with("Exception")
                || SPECIAL_EXCEPTIONS.contains(&name)
        }
        _ => false,
    }
}

/// Exceptions become records under a Python 3 qualified name.
pub(crate) fn exception(_: &Registry, class: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let qualified = match class.module.as_str() {
        "exceptions" | "__builtin__" => format!("builtins.{}", class.name),
        _ => class.qualified(),
    };
    Ok(Value::object(ClassDict::with_args(qualified, args)))
}

fn set(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    Ok(Value::set(collect_keys(args)?))
}

fn frozenset(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    Ok(Value::frozenset(collect_keys(args)?))
}

fn collect_keys(args: Vec<Value>) -> std::result::Result<Vec<Key>, String> {
    match args.as_slice() {
        [] => Ok(Vec::new()),
        [iterable] => iterable
            .elements()
            .ok_or_else(|| format!("'{}' object is not iterable", iterable.type_name()))?
            .iter()
            .map(|item| item.to_key().map_err(|e| e.to_string()))
            .collect(),
        _ => Err(format!("expected at most 1 argument, got {}", args.len())),
    }
}

fn bytearray(registry: &Registry, class: &ClassRef, args: Vec<Value>) -> FactoryResult {
    match bytes(registry, class, args)? {
        Value::Bytes(data) => Ok(Value::ByteArray(data)),
        other => Ok(other),
    }
}

fn bytes(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    match args.as_slice() {
        [] => Ok(Value::Bytes(Vec::new())),
        [Value::Bytes(data)] | [Value::ByteArray(data)] => Ok(Value::Bytes(data.clone())),
        [Value::String(text), Value::String(encoding)] => {
            encode_text(text, encoding).map(Value::Bytes)
        }
        [iterable] => {
            let items = iterable
                .elements()
                .ok_or_else(|| format!("cannot convert '{}' object to bytes", iterable.type_name()))?;
            items
                .iter()
                .map(|item| match item {
                    Value::Int(i) => u8::try_from(*i).map_err(|_| format!("byte {i} out of range(0, 256)")),
                    other => Err(format!("'{}' object cannot be interpreted as an integer", other.type_name())),
                })
                .collect::<std::result::Result<Vec<u8>, String>>()
                .map(Value::Bytes)
        }
        _ => Err(format!("unsupported arguments ({} given)", args.len())),
    }
}

fn codecs_encode(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    match args.as_slice() {
        [Value::String(text), Value::String(encoding)] => encode_text(text, encoding).map(Value::Bytes),
        [Value::String(text)] => Ok(Value::Bytes(text.as_bytes().to_vec())),
        _ => Err("expected (str, encoding)".to_string()),
    }
}

fn encode_text(text: &str, encoding: &str) -> std::result::Result<Vec<u8>, String> {
    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).map_err(|_| format!("character {c:?} not in latin-1")))
            .collect(),
        "utf-8" | "utf8" => Ok(text.as_bytes().to_vec()),
        "ascii" => {
            if text.is_ascii() {
                Ok(text.as_bytes().to_vec())
            } else {
                Err("text is not ascii".to_string())
            }
        }
        other => Err(format!("unknown encoding {other}")),
    }
}

fn object(_: &Registry, class: &ClassRef, args: Vec<Value>) -> FactoryResult {
    if !args.is_empty() {
        return Err("object() takes no arguments".to_string());
    }
    Ok(Value::object(ClassDict::new(class.qualified())))
}

// copyreg._reconstructor(cls, base, state)
fn reconstructor(registry: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let mut args = args.into_iter();
    let (Some(Value::Class(cls)), Some(Value::Class(_base)), Some(state)) =
        (args.next(), args.next(), args.next())
    else {
        return Err("expected (class, base, state)".to_string());
    };
    let ctor_args = if state.is_none() { Vec::new() } else { vec![state] };
    registry.construct(&cls, ctor_args).map_err(|e| e.to_string())
}

fn ordered_dict(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let mut dict = Vec::new();
    if let Some(pairs) = args.first() {
        let items = pairs
            .elements()
            .ok_or_else(|| format!("'{}' object is not iterable", pairs.type_name()))?;
        for pair in items {
            match pair.elements().as_deref() {
                Some([key, value]) => {
                    dict.push((key.to_key().map_err(|e| e.to_string())?, value.clone()))
                }
                _ => return Err("expected key/value pairs".to_string()),
            }
        }
    }
    Ok(Value::dict(dict))
}

fn pyro_uri(_: &Registry, class: &ClassRef, args: Vec<Value>) -> FactoryResult {
    match args.as_slice() {
        // state arrives later through BUILD
        [] => Ok(Value::object(ClassDict::new(class.qualified()))),
        [Value::String(text)] => PyroUri::parse(text)
            .map(Value::native)
            .map_err(|e| e.to_string()),
        _ => Err("expected a single URI string".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn construct(module: &str, name: &str, args: Vec<Value>) -> Value {
        Registry::default()
            .construct(&ClassRef::new(module, name), args)
            .expect("construct")
    }

    #[test]
    fn test_exception_rule() {
        assert!(is_exception_class("builtins", "ValueError"));
        assert!(is_exception_class("__builtin__", "UserWarning"));
        assert!(is_exception_class("builtins", "StopIteration"));
        assert!(is_exception_class("Pyro4.errors", "NamingError"));
        assert!(is_exception_class("exceptions", "ZeroDivisionError"));
        assert!(!is_exception_class("builtins", "dict"));
        assert!(!is_exception_class("shop", "OrderError"));
    }

    #[test]
    fn test_python2_exception_normalized() {
        let value = construct("exceptions", "ZeroDivisionError", vec![Value::from("division by zero")]);
        let Value::Object(record) = value else {
            panic!("expected record");
        };
        assert_eq!(record.read().class_name(), "builtins.ZeroDivisionError");
    }

    #[test]
    fn test_codecs_encode_latin1() {
        let value = construct("_codecs", "encode", vec![Value::from("\u{ff}a"), Value::from("latin1")]);
        assert_eq!(value, Value::Bytes(vec![0xff, b'a']));
    }

    #[test]
    fn test_bytes_from_int_list() {
        let ints = Value::list(vec![Value::Int(97), Value::Int(98), Value::Int(99)]);
        assert_eq!(construct("__builtin__", "bytes", vec![ints]), Value::Bytes(b"abc".to_vec()));
        assert_eq!(construct("builtins", "bytearray", vec![]), Value::ByteArray(Vec::new()));
    }

    #[test]
    fn test_reconstructor_builds_record() {
        let value = construct(
            "copy_reg",
            "_reconstructor",
            vec![
                Value::Class(ClassRef::new("shop", "Fruit")),
                Value::Class(ClassRef::new("__builtin__", "object")),
                Value::None,
            ],
        );
        let Value::Object(record) = value else {
            panic!("expected record");
        };
        assert_eq!(record.read().class_name(), "shop.Fruit");
    }

    #[test]
    fn test_ordered_dict_from_pairs() {
        let pairs = Value::list(vec![Value::list(vec![Value::from("a"), Value::Int(1)])]);
        let value = construct("collections", "OrderedDict", vec![pairs]);
        assert_eq!(value.get_item("a"), Some(Value::Int(1)));
    }

    #[test]
    fn test_uri_from_string() {
        let value = construct("Pyro4.core", "URI", vec![Value::from("PYRO:thing@localhost:9999")]);
        let uri = value.as_native::<PyroUri>().expect("native uri");
        assert_eq!(uri.port, 9999);
    }
}
