//! The polymorphic value carried by store keys.
//!
//! The wire tags a value with its type name; fixed-width integers
//! travel as big-endian bytes, floats, bools and complex numbers as
//! text, strings and raw bytes as-is, and JSON payloads as their
//! serialized form. All byte payloads are value-escaped on the wire.

use num_complex::Complex;
use thiserror::Error;

use crate::escape::value_escape;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("invalid {0} value")]
    InvalidWidth(&'static str),
    #[error("invalid {0} value")]
    Parse(&'static str),
    #[error("unrecognized value type {0}")]
    UnrecognizedType(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NativeValue {
    Bytes(Vec<u8>),
    Str(String),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Complex64(Complex<f32>),
    Complex128(Complex<f64>),
    Json(serde_json::Value),
}

fn width_check(value: &[u8], want: usize, name: &'static str) -> Result<(), ValueError> {
    if value.len() == want {
        Ok(())
    } else {
        Err(ValueError::InvalidWidth(name))
    }
}

fn text_of<'a>(value: &'a [u8], name: &'static str) -> Result<&'a str, ValueError> {
    std::str::from_utf8(value).map_err(|_| ValueError::Parse(name))
}

impl NativeValue {
    /// Decode a wire value from its exact bytes and the in-band type
    /// tag. An empty tag means raw bytes; a `json-*` tag carries
    /// serialized JSON.
    pub fn decode(value: &[u8], value_type: &str) -> Result<NativeValue, ValueError> {
        match value_type {
            "" => Ok(NativeValue::Bytes(value.to_vec())),
            "string" => Ok(NativeValue::Str(
                String::from_utf8_lossy(value).into_owned(),
            )),
            "int8" => {
                width_check(value, 1, "int8")?;
                Ok(NativeValue::Int8(value[0] as i8))
            }
            "int16" => {
                width_check(value, 2, "int16")?;
                Ok(NativeValue::Int16(i16::from_be_bytes([value[0], value[1]])))
            }
            "int32" => {
                width_check(value, 4, "int32")?;
                Ok(NativeValue::Int32(i32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ])))
            }
            "int64" => {
                width_check(value, 8, "int64")?;
                let mut by = [0u8; 8];
                by.copy_from_slice(value);
                Ok(NativeValue::Int64(i64::from_be_bytes(by)))
            }
            "uint8" => {
                width_check(value, 1, "uint8")?;
                Ok(NativeValue::UInt8(value[0]))
            }
            "uint16" => {
                width_check(value, 2, "uint16")?;
                Ok(NativeValue::UInt16(u16::from_be_bytes([
                    value[0], value[1],
                ])))
            }
            "uint32" => {
                width_check(value, 4, "uint32")?;
                Ok(NativeValue::UInt32(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ])))
            }
            "uint64" => {
                width_check(value, 8, "uint64")?;
                let mut by = [0u8; 8];
                by.copy_from_slice(value);
                Ok(NativeValue::UInt64(u64::from_be_bytes(by)))
            }
            "float32" => {
                let f: f32 = text_of(value, "float32")?
                    .parse()
                    .map_err(|_| ValueError::Parse("float32"))?;
                Ok(NativeValue::Float32(f))
            }
            "float64" => {
                let f: f64 = text_of(value, "float64")?
                    .parse()
                    .map_err(|_| ValueError::Parse("float64"))?;
                Ok(NativeValue::Float64(f))
            }
            "bool" => {
                let b: bool = text_of(value, "bool")?
                    .parse()
                    .map_err(|_| ValueError::Parse("bool"))?;
                Ok(NativeValue::Bool(b))
            }
            "complex64" => {
                let c: Complex<f32> = text_of(value, "complex64")?
                    .parse()
                    .map_err(|_| ValueError::Parse("complex64"))?;
                Ok(NativeValue::Complex64(c))
            }
            "complex128" => {
                let c: Complex<f64> = text_of(value, "complex128")?
                    .parse()
                    .map_err(|_| ValueError::Parse("complex128"))?;
                Ok(NativeValue::Complex128(c))
            }
            other if other.starts_with("json-") => {
                let parsed = serde_json::from_slice(value)
                    .map_err(|_| ValueError::Parse("json"))?;
                Ok(NativeValue::Json(parsed))
            }
            other => Err(ValueError::UnrecognizedType(other.to_string())),
        }
    }

    /// Encode for the wire: the value-escaped payload and the type tag.
    pub fn encode(&self) -> (String, String) {
        match self {
            NativeValue::Bytes(b) => (value_escape(b), String::new()),
            NativeValue::Str(s) => (value_escape(s.as_bytes()), "string".into()),
            NativeValue::Int8(n) => (value_escape(&n.to_be_bytes()), "int8".into()),
            NativeValue::Int16(n) => (value_escape(&n.to_be_bytes()), "int16".into()),
            NativeValue::Int32(n) => (value_escape(&n.to_be_bytes()), "int32".into()),
            NativeValue::Int64(n) => (value_escape(&n.to_be_bytes()), "int64".into()),
            NativeValue::UInt8(n) => (value_escape(&n.to_be_bytes()), "uint8".into()),
            NativeValue::UInt16(n) => (value_escape(&n.to_be_bytes()), "uint16".into()),
            NativeValue::UInt32(n) => (value_escape(&n.to_be_bytes()), "uint32".into()),
            NativeValue::UInt64(n) => (value_escape(&n.to_be_bytes()), "uint64".into()),
            NativeValue::Float32(f) => (value_escape(f.to_string().as_bytes()), "float32".into()),
            NativeValue::Float64(f) => (value_escape(f.to_string().as_bytes()), "float64".into()),
            NativeValue::Bool(b) => (value_escape(b.to_string().as_bytes()), "bool".into()),
            NativeValue::Complex64(c) => {
                (value_escape(c.to_string().as_bytes()), "complex64".into())
            }
            NativeValue::Complex128(c) => {
                (value_escape(c.to_string().as_bytes()), "complex128".into())
            }
            NativeValue::Json(v) => {
                let kind = match v {
                    serde_json::Value::Null => "null",
                    serde_json::Value::Bool(_) => "bool",
                    serde_json::Value::Number(_) => "number",
                    serde_json::Value::String(_) => "string",
                    serde_json::Value::Array(_) => "array",
                    serde_json::Value::Object(_) => "object",
                };
                let data = serde_json::to_vec(v).unwrap_or_default();
                (value_escape(&data), format!("json-{kind}"))
            }
        }
    }

    /// Numeric view used by the expression evaluator. Non-numeric
    /// values (including numeric-looking strings) read as `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Int8(n) => Some(*n as f64),
            NativeValue::Int16(n) => Some(*n as f64),
            NativeValue::Int32(n) => Some(*n as f64),
            NativeValue::Int64(n) => Some(*n as f64),
            NativeValue::UInt8(n) => Some(*n as f64),
            NativeValue::UInt16(n) => Some(*n as f64),
            NativeValue::UInt32(n) => Some(*n as f64),
            NativeValue::UInt64(n) => Some(*n as f64),
            NativeValue::Float32(f) => Some(*f as f64),
            NativeValue::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Wrap a computed numeric result: integral magnitudes stay
    /// integers, everything else becomes float64.
    pub fn from_numeric(n: f64) -> NativeValue {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            NativeValue::Int64(n as i64)
        } else {
            NativeValue::Float64(n)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_have_empty_type_tag() {
        let v = NativeValue::decode(&[0u8, 1, 2], "").unwrap();
        assert_eq!(v, NativeValue::Bytes(vec![0, 1, 2]));
        let (escaped, tag) = v.encode();
        assert_eq!(escaped, "\\00\\01\\02");
        assert_eq!(tag, "");
    }

    #[test]
    fn int32_big_endian_round_trip() {
        let v = NativeValue::decode(&0x01020304i32.to_be_bytes(), "int32").unwrap();
        assert_eq!(v, NativeValue::Int32(0x01020304));
        let (escaped, tag) = v.encode();
        assert_eq!(tag, "int32");
        assert_eq!(escaped, "\\01\\02\\03\\04");
    }

    #[test]
    fn int32_wrong_width_rejected() {
        let err = NativeValue::decode(&[1, 2], "int32").unwrap_err();
        assert_eq!(err.to_string(), "invalid int32 value");
    }

    #[test]
    fn uint8_decodes_unsigned() {
        let v = NativeValue::decode(&[0xFF], "uint8").unwrap();
        assert_eq!(v, NativeValue::UInt8(255));
    }

    #[test]
    fn float64_keeps_full_precision() {
        let text = "3.141592653589793";
        let v = NativeValue::decode(text.as_bytes(), "float64").unwrap();
        assert_eq!(v, NativeValue::Float64(std::f64::consts::PI));
    }

    #[test]
    fn bool_and_string_from_text() {
        assert_eq!(
            NativeValue::decode(b"true", "bool").unwrap(),
            NativeValue::Bool(true)
        );
        assert_eq!(
            NativeValue::decode(b"hi", "string").unwrap(),
            NativeValue::Str("hi".into())
        );
    }

    #[test]
    fn complex_parses_and_formats() {
        let v = NativeValue::decode(b"3+4i", "complex128").unwrap();
        let (escaped, tag) = v.encode();
        assert_eq!(tag, "complex128");
        assert_eq!(escaped, "3+4i");
    }

    #[test]
    fn json_tag_reflects_kind() {
        let v = NativeValue::decode(br#"{"a":1}"#, "json-object").unwrap();
        let (_, tag) = v.encode();
        assert_eq!(tag, "json-object");
        let v = NativeValue::decode(b"[1,2]", "json-anything").unwrap();
        let (_, tag) = v.encode();
        assert_eq!(tag, "json-array");
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = NativeValue::decode(b"x", "decimal").unwrap_err();
        assert_eq!(err.to_string(), "unrecognized value type decimal");
    }

    #[test]
    fn numeric_result_wrapping() {
        assert_eq!(NativeValue::from_numeric(4.0), NativeValue::Int64(4));
        assert_eq!(NativeValue::from_numeric(2.5), NativeValue::Float64(2.5));
    }
}
