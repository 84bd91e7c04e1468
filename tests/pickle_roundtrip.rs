//! Decoding pickles written by CPython, and encoding values back.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use pyro_wire::core::unpickler::loads_with;
use pyro_wire::core::value::{ClassRef, Key};
use pyro_wire::error::ProtocolError;
use chrono::{FixedOffset, NaiveDate, NaiveTime, TimeDelta};
use pyro_wire::{
    dumps, loads, PyArray, PyComplex, PyDateTime, PyDecimal, PyTimeZone, Registry,
    RegistryBuilder, RemoteError, Unpickler, Value,
};
use std::sync::Arc;

/// `[1, 2, 3, (11, 12, 13), {'banana', 'grape', 'apple'}]`
fn fruit_list() -> Value {
    Value::list(vec![
        Value::Int(1),
        Value::Int(2),
        Value::Int(3),
        Value::tuple(vec![Value::Int(11), Value::Int(12), Value::Int(13)]),
        Value::set([Key::from("banana"), Key::from("grape"), Key::from("apple")]),
    ])
}

// ============================================================================
// CPython output
// ============================================================================

#[test]
fn python_list_protocol_0() {
    let data = b"(lp0\nI1\naI2\naI3\na(I11\nI12\nI13\ntp1\nac__builtin__\nset\np2\n((lp3\nVapple\np4\naVgrape\np5\naVbanana\np6\natp7\nRp8\na.";
    assert_eq!(loads(data).unwrap(), fruit_list());
}

#[test]
fn python_list_protocol_2() {
    let data = b"\x80\x02]q\x00(K\x01K\x02K\x03K\x0bK\x0cK\r\x87q\x01c__builtin__\nset\nq\x02]q\x03(X\x05\x00\x00\x00appleq\x04X\x05\x00\x00\x00grapeq\x05X\x06\x00\x00\x00bananaq\x06e\x85q\x07Rq\x08e.";
    assert_eq!(loads(data).unwrap(), fruit_list());
}

#[test]
fn python_list_protocol_4() {
    let data = b"\x80\x04\x950\x00\x00\x00\x00\x00\x00\x00]\x94(K\x01K\x02K\x03K\x0bK\x0cK\r\x87\x94\x8f\x94(\x8c\x05apple\x94\x8c\x05grape\x94\x8c\x06banana\x94\x90e.";
    assert_eq!(loads(data).unwrap(), fruit_list());
}

#[test]
fn python_dict_with_bytes_via_codecs() {
    let data = b"\x80\x02}q\x00(X\x01\x00\x00\x00aq\x01]q\x02(G?\xf8\x00\x00\x00\x00\x00\x00N\x88eX\x01\x00\x00\x00bq\x03c_codecs\nencode\nq\x04X\x03\x00\x00\x00\x00\xc3\xbfq\x05X\x06\x00\x00\x00latin1q\x06\x86q\x07Rq\x08u.";
    let value = loads(data).unwrap();
    assert_eq!(
        value.get_item("a"),
        Some(Value::list(vec![Value::Float(1.5), Value::None, Value::Bool(true)]))
    );
    assert_eq!(value.get_item("b"), Some(Value::Bytes(vec![0x00, 0xff])));
}

#[test]
fn python_big_integers() {
    let positive = loads(b"\x80\x02\x8a\t\x00\x00\x00\x00\x00\x00\x00\x00@.").unwrap();
    let expected: num_bigint::BigInt = num_bigint::BigInt::from(1u8) << 70;
    assert_eq!(positive, Value::from_bigint(expected.clone()));

    let negative = loads(b"L-1180591620717411303424L\n.").unwrap();
    assert_eq!(negative, Value::from_bigint(-expected));
}

#[test]
fn python_ordered_dict_is_dict() {
    let data = b"\x80\x02ccollections\nOrderedDict\nq\x00)Rq\x01X\x01\x00\x00\x00xq\x02K\x01s.";
    let value = loads(data).unwrap();
    assert!(matches!(value, Value::Dict(_)));
    assert_eq!(value.get_item("x"), Some(Value::Int(1)));
}

#[test]
fn python_self_referencing_list() {
    let value = loads(b"\x80\x02]q\x00h\x00a.").unwrap();
    let items = value.elements().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].identity(), value.identity());
}

#[test]
fn python_bytearray_protocol_5() {
    let data = b"\x80\x05\x95\r\x00\x00\x00\x00\x00\x00\x00\x96\x02\x00\x00\x00\x00\x00\x00\x00ab\x94.";
    assert_eq!(loads(data).unwrap(), Value::ByteArray(b"ab".to_vec()));
}

#[test]
fn python_text_unicode_protocol_0() {
    assert_eq!(loads(b"Vh\xe9\np0\n.").unwrap(), Value::from("h\u{e9}"));
}

#[test]
fn python_exception_instance() {
    let data = b"\x80\x02cexceptions\nZeroDivisionError\nq\x00X\x10\x00\x00\x00division by zeroq\x01\x85q\x02Rq\x03.";
    let err = RemoteError::from_value(&loads(data).unwrap()).unwrap();
    assert_eq!(err.type_tag, "builtins.ZeroDivisionError");
    assert_eq!(err.message, "division by zero");
}

// ============================================================================
// Unknown classes and custom constructors
// ============================================================================

const FRUIT_PROTO_2: &[u8] = b"\x80\x02cshop.fruit\nFruit\nq\x00)\x81q\x01}q\x02(X\x04\x00\x00\x00nameq\x03X\x05\x00\x00\x00appleq\x04X\x06\x00\x00\x00weightq\x05G?\xf8\x00\x00\x00\x00\x00\x00ub.";

#[test]
fn unknown_class_becomes_record() {
    let Value::Object(record) = loads(FRUIT_PROTO_2).unwrap() else {
        panic!("expected a record");
    };
    let record = record.read();
    assert_eq!(record.class_name(), "shop.fruit.Fruit");
    assert_eq!(record.get("name"), Some(&Value::from("apple")));
    assert_eq!(record.get("weight"), Some(&Value::Float(1.5)));
}

#[test]
fn shared_instances_keep_identity() {
    let data = b"\x80\x04\x95G\x00\x00\x00\x00\x00\x00\x00]\x94(\x8c\nshop.fruit\x94\x8c\x05Fruit\x94\x93\x94)\x81\x94}\x94(\x8c\x04name\x94\x8c\x05apple\x94\x8c\x06weight\x94G?\xf8\x00\x00\x00\x00\x00\x00ubh\x04e.";
    let items = loads(data).unwrap().elements().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items[0].identity().is_some());
    assert_eq!(items[0].identity(), items[1].identity());
}

#[derive(Debug, PartialEq)]
struct Crate(Vec<i64>);

#[test]
fn custom_constructor_wins() {
    let registry = RegistryBuilder::new()
        .register_constructor("shop.fruit.Crate", |_: &ClassRef, args: Vec<Value>| {
            let items = args
                .first()
                .and_then(Value::elements)
                .ok_or_else(|| ProtocolError::Decode("crate needs items".into()))?;
            Ok(Value::native(Crate(items.iter().filter_map(Value::as_i64).collect())))
        })
        .build();
    let data = b"\x80\x02cshop.fruit\nCrate\nq\x00]q\x01(K\x01K\x02e\x85q\x02Rq\x03.";
    let value = loads_with(data, Arc::new(registry)).unwrap();
    assert_eq!(value.as_native::<Crate>(), Some(&Crate(vec![1, 2])));
}

#[test]
fn failing_constructor_error_propagates() {
    let registry = RegistryBuilder::new()
        .register_constructor("shop.fruit.Crate", |_: &ClassRef, _: Vec<Value>| {
            Err(ProtocolError::Decode("refused".into()))
        })
        .build();
    let data = b"\x80\x02cshop.fruit\nCrate\nq\x00]q\x01(K\x01K\x02e\x85q\x02Rq\x03.";
    let err = Unpickler::new(Arc::new(registry)).loads(data).unwrap_err();
    assert!(err.to_string().contains("refused"), "{err}");
}

// ============================================================================
// Encoding
// ============================================================================

#[test]
fn roundtrip_every_write_protocol() {
    let shared = Value::dict([(Key::from("k"), Value::from("v"))]);
    let value = Value::tuple(vec![
        fruit_list(),
        shared.clone(),
        shared,
        Value::Bytes(vec![0, 1, 2, 255]),
        Value::frozenset([Key::Int(1), Key::Int(2)]),
        Value::from_bigint(num_bigint::BigInt::from(i64::MAX) * 3),
        Value::from("snowman \u{2603}"),
    ]);
    for protocol in 2..=5 {
        let decoded = loads(&dumps(&value, protocol).unwrap()).unwrap();
        assert_eq!(decoded, value, "protocol {protocol}");
        let parts = decoded.elements().unwrap();
        assert_eq!(parts[1].identity(), parts[2].identity(), "protocol {protocol}");
    }
}

#[test]
fn recursive_structures_survive() {
    let outer = Value::list(Vec::new());
    if let Value::List(items) = &outer {
        items.write().push(outer.clone());
    }
    for protocol in 2..=5 {
        let decoded = loads(&dumps(&outer, protocol).unwrap()).unwrap();
        let items = decoded.elements().unwrap();
        assert_eq!(items[0].identity(), decoded.identity());
    }
}

#[test]
fn records_reencode_as_reduce() {
    let record = loads(FRUIT_PROTO_2).unwrap();
    let again = loads(&dumps(&record, 2).unwrap()).unwrap();
    assert_eq!(again, record);
}

#[test]
fn unsupported_write_protocol() {
    for protocol in [0u8, 1, 6] {
        assert!(matches!(
            dumps(&Value::None, protocol),
            Err(ProtocolError::Encode(_))
        ));
    }
}

#[test]
fn empty_registry_keeps_builtins_as_records() {
    let registry: Registry = RegistryBuilder::empty().build();
    let data = b"\x80\x02c__builtin__\nset\nq\x00]q\x01K\x01a\x85q\x02Rq\x03.";
    let value = loads_with(data, Arc::new(registry)).unwrap();
    assert!(matches!(value, Value::Object(_)));
}

// ============================================================================
// Standard-library types
// ============================================================================

fn march_15(h: u32, m: u32, s: u32, us: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 15)
        .unwrap()
        .and_hms_micro_opt(h, m, s, us)
        .unwrap()
}

#[test]
fn python_datetime_every_protocol() {
    let expected = PyDateTime::naive(march_15(13, 45, 30, 123_456));
    let pickles: [&[u8]; 3] = [
        b"cdatetime\ndatetime\np0\n(c_codecs\nencode\np1\n(V\x07\xe8\x03\x0f\\u000d-\x1e\x01\xe2@\np2\nVlatin1\np3\ntp4\nRp5\ntp6\nRp7\n.",
        b"\x80\x02cdatetime\ndatetime\nq\x00c_codecs\nencode\nq\x01X\x0c\x00\x00\x00\x07\xc3\xa8\x03\x0f\r-\x1e\x01\xc3\xa2@q\x02X\x06\x00\x00\x00latin1q\x03\x86q\x04Rq\x05\x85q\x06Rq\x07.",
        b"\x80\x03cdatetime\ndatetime\nq\x00C\n\x07\xe8\x03\x0f\r-\x1e\x01\xe2@q\x01\x85q\x02Rq\x03.",
    ];
    for data in pickles {
        let value = loads(data).unwrap();
        assert_eq!(value.as_native::<PyDateTime>(), Some(&expected));
    }
}

#[test]
fn python_datetime_with_timezone() {
    let utc = loads(b"\x80\x03cdatetime\ndatetime\nq\x00C\n\x07\xe8\x03\x0f\r-\x1e\x00\x00\x00q\x01cdatetime\ntimezone\nq\x02cdatetime\ntimedelta\nq\x03K\x00K\x00K\x00\x87q\x04Rq\x05\x85q\x06Rq\x07\x86q\x08Rq\t.").unwrap();
    let utc = utc.as_native::<PyDateTime>().unwrap();
    assert_eq!(utc.tzinfo, Some(PyTimeZone::Utc));
    assert_eq!(utc.isoformat(), "2024-03-15T13:45:30+00:00");

    let plus_two = loads(b"\x80\x03cdatetime\ndatetime\nq\x00C\n\x07\xe8\x03\x0f\r-\x1e\x00\x00\x00q\x01cdatetime\ntimezone\nq\x02cdatetime\ntimedelta\nq\x03K\x00M \x1cK\x00\x87q\x04Rq\x05\x85q\x06Rq\x07\x86q\x08Rq\t.").unwrap();
    let plus_two = plus_two.as_native::<PyDateTime>().unwrap();
    assert_eq!(plus_two.to_fixed().unwrap().timestamp(), 1_710_503_130);
}

#[test]
fn python_date_time_and_timedelta() {
    let date = loads(b"\x80\x03cdatetime\ndate\nq\x00C\x04\x07\xe8\x03\x0fq\x01\x85q\x02Rq\x03.").unwrap();
    assert_eq!(date.as_native::<NaiveDate>(), NaiveDate::from_ymd_opt(2024, 3, 15).as_ref());

    let time = loads(b"\x80\x03cdatetime\ntime\nq\x00C\x06\r-\x1e\x00\x01\xf4q\x01\x85q\x02Rq\x03.").unwrap();
    assert_eq!(time.as_native::<NaiveTime>(), NaiveTime::from_hms_micro_opt(13, 45, 30, 500).as_ref());

    // timedelta(days=-1, seconds=3600, microseconds=5)
    let delta = loads(b"\x80\x02cdatetime\ntimedelta\nq\x00J\xff\xff\xff\xffM\x10\x0eK\x05\x87q\x01Rq\x02.").unwrap();
    let delta = delta.as_native::<TimeDelta>().unwrap();
    assert_eq!(delta.num_microseconds(), Some(-82_800 * 1_000_000 + 5));
}

#[test]
fn python_decimal_and_complex() {
    let decimal = loads(b"\x80\x02cdecimal\nDecimal\nq\x00X\n\x00\x00\x0012345.6789q\x01\x85q\x02Rq\x03.").unwrap();
    assert_eq!(decimal.as_native::<PyDecimal>().unwrap().as_str(), "12345.6789");

    let exponent = loads(b"\x80\x04\x95&\x00\x00\x00\x00\x00\x00\x00\x8c\x07decimal\x94\x8c\x07Decimal\x94\x93\x94\x8c\x08-1.5E+10\x94\x85\x94R\x94.").unwrap();
    assert_eq!(exponent.as_native::<PyDecimal>().unwrap().to_f64(), Some(-1.5e10));

    let complex = loads(b"\x80\x02c__builtin__\ncomplex\nq\x00G?\xf8\x00\x00\x00\x00\x00\x00G\xc0\x00\x00\x00\x00\x00\x00\x00\x86q\x01Rq\x02.").unwrap();
    assert_eq!(complex.as_native::<PyComplex>(), Some(&PyComplex::new(1.5, -2.0)));
}

#[test]
fn python_arrays() {
    let ints = PyArray::new('i', vec![Value::Int(1), Value::Int(2), Value::Int(-3)]).unwrap();
    let list_form = loads(b"\x80\x02carray\narray\nq\x00X\x01\x00\x00\x00iq\x01]q\x02(K\x01K\x02J\xfd\xff\xff\xffe\x86q\x03Rq\x04.").unwrap();
    assert_eq!(list_form.as_native::<PyArray>(), Some(&ints));
    let machine_form = loads(b"\x80\x03carray\n_array_reconstructor\nq\x00(carray\narray\nq\x01X\x01\x00\x00\x00iq\x02K\x08C\x0c\x01\x00\x00\x00\x02\x00\x00\x00\xfd\xff\xff\xffq\x03tq\x04Rq\x05.").unwrap();
    assert_eq!(machine_form.as_native::<PyArray>(), Some(&ints));

    let doubles = loads(b"\x80\x04\x95R\x00\x00\x00\x00\x00\x00\x00\x8c\x05array\x94\x8c\x14_array_reconstructor\x94\x93\x94(\x8c\x05array\x94\x8c\x05array\x94\x93\x94\x8c\x01d\x94K\x10C\x10\x00\x00\x00\x00\x00\x00\xe0?\x00\x00\x00\x00\x00\x00\x02\xc0\x94t\x94R\x94.").unwrap();
    let doubles = doubles.as_native::<PyArray>().unwrap();
    assert_eq!(doubles.items, vec![Value::Float(0.5), Value::Float(-2.25)]);

    let text = loads(b"\x80\x03carray\n_array_reconstructor\nq\x00(carray\narray\nq\x01X\x01\x00\x00\x00uq\x02K\x14C\x08h\x00\x00\x00\xe9\x00\x00\x00q\x03tq\x04Rq\x05.").unwrap();
    let text = text.as_native::<PyArray>().unwrap();
    assert_eq!(text.typecode, 'u');
    assert_eq!(text.items, vec![Value::from("h"), Value::from("\u{e9}")]);
}

#[test]
fn stdlib_values_reencode() {
    let amsterdam = PyDateTime::with_tzinfo(
        march_15(9, 30, 0, 250),
        PyTimeZone::Named("Europe/Amsterdam".into()),
    );
    let offset = PyDateTime::with_tzinfo(
        march_15(9, 30, 0, 0),
        PyTimeZone::Fixed(FixedOffset::east_opt(-3 * 3600).unwrap()),
    );
    for protocol in [2, 4] {
        let data = dumps(&Value::native(amsterdam.clone()), protocol).unwrap();
        assert_eq!(loads(&data).unwrap().as_native::<PyDateTime>(), Some(&amsterdam));

        let data = dumps(&Value::native(offset.clone()), protocol).unwrap();
        assert_eq!(loads(&data).unwrap().as_native::<PyDateTime>(), Some(&offset));

        let delta = TimeDelta::microseconds(-1);
        let data = dumps(&Value::native(delta), protocol).unwrap();
        assert_eq!(loads(&data).unwrap().as_native::<TimeDelta>(), Some(&delta));

        let decimal = PyDecimal::parse("-0.000123").unwrap();
        let data = dumps(&Value::native(decimal.clone()), protocol).unwrap();
        assert_eq!(loads(&data).unwrap().as_native::<PyDecimal>(), Some(&decimal));

        let complex = PyComplex::new(0.25, 4.0);
        let data = dumps(&Value::native(complex), protocol).unwrap();
        assert_eq!(loads(&data).unwrap().as_native::<PyComplex>(), Some(&complex));

        let shorts = PyArray::new('h', vec![Value::Int(-2), Value::Int(300)]).unwrap();
        let data = dumps(&Value::native(shorts.clone()), protocol).unwrap();
        assert_eq!(loads(&data).unwrap().as_native::<PyArray>(), Some(&shorts));
    }
}

#[test]
fn dateutil_utc_through_reconstructor() {
    // copy_reg._reconstructor(tzutc, tzinfo, None) followed by an empty BUILD
    let data = b"\x80\x02ccopy_reg\n_reconstructor\nq\x00cdateutil.tz.tz\ntzutc\nq\x01cdatetime\ntzinfo\nq\x02N\x87q\x03Rq\x04}q\x05b.";
    let value = loads(data).unwrap();
    assert_eq!(value.as_native::<PyTimeZone>(), Some(&PyTimeZone::Utc));
}
