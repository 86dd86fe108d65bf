use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger(0))));
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i-e").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(decode(b"4:spam").unwrap(), Value::bytes(b"spam"));
    assert_eq!(decode(b"0:").unwrap(), Value::bytes(b""));
}

#[test]
fn test_decode_truncated_string() {
    assert!(matches!(
        decode(b"10:short"),
        Err(BencodeError::UnexpectedEof(_))
    ));
}

#[test]
fn test_decode_list() {
    let result = decode(b"l4:spami42ee").unwrap();
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0], Value::bytes(b"spam"));
    assert_eq!(list[1], Value::Integer(42));
}

#[test]
fn test_decode_dict() {
    let result = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    let dict = result.as_dict().unwrap();
    assert_eq!(dict.len(), 2);
    assert_eq!(result.get(b"cow"), Some(&Value::bytes(b"moo")));
}

#[test]
fn test_decode_dict_non_string_key() {
    assert!(matches!(
        decode(b"di1e3:mooe"),
        Err(BencodeError::UnexpectedByte { byte: b'i', .. })
    ));
}

#[test]
fn test_decode_unterminated_dict() {
    assert!(decode(b"d1:ti1e").is_err());
}

#[test]
fn test_nesting_limit() {
    let mut data = vec![b'l'; 100];
    data.extend(vec![b'e'; 100]);
    assert_eq!(decode(&data), Err(BencodeError::NestingTooDeep));
}

#[test]
fn test_encode_values() {
    assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
    assert_eq!(encode(&Value::bytes(b"spam")), b"4:spam");

    let list = Value::List(vec![Value::bytes(b"spam"), Value::Integer(42)]);
    assert_eq!(encode(&list), b"l4:spami42ee");

    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"cow"), Value::bytes(b"moo"));
    assert_eq!(encode(&Value::Dict(dict)), b"d3:cow3:mooe");
}

#[test]
fn test_roundtrip_krpc_query() {
    let original = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
    let decoded = decode(original).unwrap();
    assert_eq!(encode(&decoded), original);
}

#[test]
fn test_trailing_data_error() {
    assert_eq!(decode(b"i42eextra"), Err(BencodeError::TrailingData(4)));
}

#[test]
fn test_typed_accessors() {
    let value = decode(b"d1:ai1e1:b3:xyz1:cle1:dd1:xi2eee").unwrap();

    assert_eq!(value.require_int(b"a").unwrap(), 1);
    assert_eq!(value.require_str(b"b").unwrap(), "xyz");
    assert!(value.require_list(b"c").unwrap().is_empty());
    assert_eq!(value.require_dict(b"d").unwrap().require_int(b"x").unwrap(), 2);

    assert!(value.require_int(b"zz").unwrap_err().is_missing());
    assert!(matches!(
        value.require_int(b"b"),
        Err(BencodeError::WrongType { found: "bytes", .. })
    ));
}

#[test]
fn test_optional_accessors() {
    let value = decode(b"d1:ai1e1:b3:xyze").unwrap();

    assert_eq!(value.optional_int(b"a").unwrap(), Some(1));
    assert_eq!(value.optional_int(b"missing").unwrap(), None);
    assert!(value.optional_int(b"b").is_err());
    assert!(value.optional_list(b"missing").unwrap().is_none());
}

#[test]
fn test_require_on_non_dict() {
    let value = Value::Integer(3);
    assert!(matches!(
        value.require(b"a"),
        Err(BencodeError::WrongType { found: "integer", .. })
    ));
}
