//! Fixed-width, big-endian encoding of record fields.

use crate::{Result, StorageError};
use bytes::{Buf, BufMut};
use chrono::{Datelike, NaiveDate};
use heapdb_core::{DataType, Schema, Value};

pub(crate) fn encode_record(values: &[Value], schema: &Schema, buf: &mut impl BufMut) -> Result<()> {
    schema
        .validate_values(values)
        .map_err(StorageError::SchemaMismatch)?;
    for (value, ty) in values.iter().zip(schema.types()) {
        encode_value(value, &ty, buf)?;
    }
    Ok(())
}

pub(crate) fn decode_record(mut bytes: &[u8], schema: &Schema) -> Result<Vec<Value>> {
    if bytes.len() < schema.record_size() {
        return Err(StorageError::Corrupted(format!(
            "record needs {} bytes, slot holds {}",
            schema.record_size(),
            bytes.len()
        )));
    }
    schema
        .types()
        .map(|ty| decode_value(&mut bytes, &ty))
        .collect()
}

pub(crate) fn encode_value(value: &Value, ty: &DataType, buf: &mut impl BufMut) -> Result<()> {
    match (value, ty) {
        (Value::Boolean(b), DataType::Boolean) => buf.put_u8(*b as u8),
        (Value::SmallInt(i), DataType::SmallInt) => buf.put_i16(*i),
        (Value::Integer(i), DataType::Integer) => buf.put_i32(*i),
        (Value::BigInt(i), DataType::BigInt) => buf.put_i64(*i),
        (Value::Real(r), DataType::Real) => buf.put_f32(*r),
        (Value::DoublePrecision(d), DataType::DoublePrecision) => buf.put_f64(*d),
        (Value::Char(s), DataType::Char(width)) => {
            let width = *width as usize;
            if s.len() > width {
                return Err(StorageError::SchemaMismatch(format!(
                    "'{}' does not fit in CHAR({})",
                    s, width
                )));
            }
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
            buf.put_bytes(0, width - s.len());
        }
        (Value::Date(d), DataType::Date) => buf.put_i32(d.num_days_from_ce()),
        (Value::Timestamp(ts), DataType::Timestamp) => buf.put_i64(ts.and_utc().timestamp_micros()),
        (Value::Uuid(u), DataType::Uuid) => buf.put_slice(u.as_bytes()),
        (value, ty) => {
            return Err(StorageError::SchemaMismatch(format!(
                "value {} is not a {}",
                value, ty
            )))
        }
    }
    Ok(())
}

pub(crate) fn decode_value(buf: &mut &[u8], ty: &DataType) -> Result<Value> {
    if buf.remaining() < ty.size() {
        return Err(StorageError::Corrupted(format!(
            "{} needs {} bytes, {} left",
            ty,
            ty.size(),
            buf.remaining()
        )));
    }
    let value = match ty {
        DataType::Boolean => match buf.get_u8() {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => {
                return Err(StorageError::Corrupted(format!(
                    "invalid boolean byte {:#04x}",
                    other
                )))
            }
        },
        DataType::SmallInt => Value::SmallInt(buf.get_i16()),
        DataType::Integer => Value::Integer(buf.get_i32()),
        DataType::BigInt => Value::BigInt(buf.get_i64()),
        DataType::Real => Value::Real(buf.get_f32()),
        DataType::DoublePrecision => Value::DoublePrecision(buf.get_f64()),
        DataType::Char(width) => {
            let width = *width as usize;
            let len = buf.get_u32() as usize;
            if len > width {
                return Err(StorageError::Corrupted(format!(
                    "CHAR({}) length prefix {} exceeds width",
                    width, len
                )));
            }
            let text = std::str::from_utf8(&buf[..len])
                .map_err(|e| StorageError::Corrupted(format!("CHAR data is not UTF-8: {}", e)))?
                .to_string();
            buf.advance(width);
            Value::Char(text)
        }
        DataType::Date => {
            let days = buf.get_i32();
            NaiveDate::from_num_days_from_ce_opt(days)
                .map(Value::Date)
                .ok_or_else(|| StorageError::Corrupted(format!("date out of range: {}", days)))?
        }
        DataType::Timestamp => {
            let micros = buf.get_i64();
            chrono::DateTime::from_timestamp_micros(micros)
                .map(|dt| Value::Timestamp(dt.naive_utc()))
                .ok_or_else(|| {
                    StorageError::Corrupted(format!("timestamp out of range: {}", micros))
                })?
        }
        DataType::Uuid => {
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Value::Uuid(uuid::Uuid::from_bytes(raw))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    fn mixed_schema() -> Schema {
        Schema::from_types([
            DataType::Boolean,
            DataType::SmallInt,
            DataType::Integer,
            DataType::BigInt,
            DataType::Real,
            DataType::DoublePrecision,
            DataType::Char(6),
            DataType::Date,
            DataType::Timestamp,
            DataType::Uuid,
        ])
    }

    fn mixed_values() -> Vec<Value> {
        let date = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        vec![
            Value::Boolean(true),
            Value::SmallInt(-3),
            Value::Integer(1 << 20),
            Value::BigInt(i64::MIN),
            Value::Real(1.5),
            Value::DoublePrecision(-0.25),
            Value::Char("héllo".into()),
            Value::Date(date),
            Value::Timestamp(date.and_hms_opt(23, 59, 58).unwrap()),
            Value::Uuid(uuid::Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef)),
        ]
    }

    #[test]
    fn test_record_occupies_exactly_record_size() {
        let schema = mixed_schema();
        let mut buf = BytesMut::new();
        encode_record(&mixed_values(), &schema, &mut buf).unwrap();
        assert_eq!(buf.len(), schema.record_size());

        let decoded = decode_record(&buf, &schema).unwrap();
        assert_eq!(decoded, mixed_values());
    }

    #[test]
    fn test_integer_is_big_endian() {
        let mut buf = BytesMut::new();
        encode_value(&Value::Integer(0x0102_0304), &DataType::Integer, &mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_char_is_length_prefixed_and_padded() {
        let mut buf = BytesMut::new();
        encode_value(&Value::Char("ab".into()), &DataType::Char(4), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 2, b'a', b'b', 0, 0]);
    }

    #[test]
    fn test_encode_rejects_wrong_type() {
        let mut buf = BytesMut::new();
        let err = encode_value(&Value::BigInt(1), &DataType::Integer, &mut buf).unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch(_)));

        let err = encode_value(&Value::Char("abc".into()), &DataType::Char(2), &mut buf)
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch(_)));
    }

    #[test]
    fn test_decode_rejects_corrupt_char_length() {
        let bytes = [0u8, 0, 0, 9, b'a', b'b'];
        let err = decode_value(&mut &bytes[..], &DataType::Char(2)).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted(_)));
    }

    #[test]
    fn test_decode_rejects_invalid_boolean() {
        let err = decode_value(&mut &[7u8][..], &DataType::Boolean).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted(_)));
    }

    #[test]
    fn test_decode_rejects_short_slot() {
        let schema = Schema::from_types([DataType::BigInt]);
        let err = decode_record(&[0u8; 4], &schema).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted(_)));
    }
}
