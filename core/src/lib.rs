//! Core types for heapdb.
//!
//! Everything here is storage-agnostic: the fixed-width data types a heap
//! record may hold, the record descriptor ([`Schema`]), records themselves
//! ([`Tuple`]) and the identifiers used to address pages, records and
//! transactions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Width in bytes of the length prefix stored in front of `Char` data.
pub const CHAR_LENGTH_PREFIX: usize = 4;

/// Column types. Every type has a fixed on-disk width so that a schema
/// always describes records of one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    /// Up to `n` bytes of UTF-8 text.
    Char(u16),
    Date,
    Timestamp,
    Uuid,
}

impl DataType {
    /// Number of bytes a value of this type occupies inside a record.
    pub fn size(&self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::SmallInt => 2,
            DataType::Integer => 4,
            DataType::BigInt => 8,
            DataType::Real => 4,
            DataType::DoublePrecision => 8,
            DataType::Char(n) => CHAR_LENGTH_PREFIX + *n as usize,
            DataType::Date => 4,
            DataType::Timestamp => 8,
            DataType::Uuid => 16,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::SmallInt => write!(f, "SMALLINT"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Real => write!(f, "REAL"),
            DataType::DoublePrecision => write!(f, "DOUBLE PRECISION"),
            DataType::Char(n) => write!(f, "CHAR({})", n),
            DataType::Date => write!(f, "DATE"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
            DataType::Uuid => write!(f, "UUID"),
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    /// Parses the short names used on the command line: `bool`, `smallint`,
    /// `int`, `bigint`, `real`, `double`, `char(N)`, `date`, `timestamp`,
    /// `uuid`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let ty = match lower.as_str() {
            "bool" | "boolean" => DataType::Boolean,
            "smallint" => DataType::SmallInt,
            "int" | "integer" => DataType::Integer,
            "bigint" => DataType::BigInt,
            "real" => DataType::Real,
            "double" => DataType::DoublePrecision,
            "date" => DataType::Date,
            "timestamp" => DataType::Timestamp,
            "uuid" => DataType::Uuid,
            other => {
                let width = other
                    .strip_prefix("char(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown type '{}'", s))?;
                let width = width
                    .parse::<u16>()
                    .map_err(|e| format!("invalid char width '{}': {}", width, e))?;
                DataType::Char(width)
            }
        };
        Ok(ty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    DoublePrecision(f64),
    Char(String),
    Date(chrono::NaiveDate),
    Timestamp(chrono::NaiveDateTime),
    Uuid(uuid::Uuid),
}

impl Value {
    /// The narrowest type able to hold this value. `Char` reports its
    /// current byte length as the width.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::SmallInt(_) => DataType::SmallInt,
            Value::Integer(_) => DataType::Integer,
            Value::BigInt(_) => DataType::BigInt,
            Value::Real(_) => DataType::Real,
            Value::DoublePrecision(_) => DataType::DoublePrecision,
            Value::Char(s) => DataType::Char(s.len().min(u16::MAX as usize) as u16),
            Value::Date(_) => DataType::Date,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Uuid(_) => DataType::Uuid,
        }
    }

    pub fn type_compatible(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Value::Boolean(_), DataType::Boolean) => true,
            (Value::SmallInt(_), DataType::SmallInt) => true,
            (Value::Integer(_), DataType::Integer) => true,
            (Value::BigInt(_), DataType::BigInt) => true,
            (Value::Real(_), DataType::Real) => true,
            (Value::DoublePrecision(_), DataType::DoublePrecision) => true,
            (Value::Char(s), DataType::Char(n)) => s.len() <= *n as usize,
            (Value::Date(_), DataType::Date) => true,
            (Value::Timestamp(_), DataType::Timestamp) => true,
            (Value::Uuid(_), DataType::Uuid) => true,
            _ => false,
        }
    }

    /// Parses a textual field into a value of `data_type`.
    pub fn parse(text: &str, data_type: &DataType) -> Result<Value, String> {
        let text = text.trim();
        let err = |e: &dyn fmt::Display| format!("cannot parse '{}' as {}: {}", text, data_type, e);
        let value = match data_type {
            DataType::Boolean => Value::Boolean(text.parse().map_err(|e| err(&e))?),
            DataType::SmallInt => Value::SmallInt(text.parse().map_err(|e| err(&e))?),
            DataType::Integer => Value::Integer(text.parse().map_err(|e| err(&e))?),
            DataType::BigInt => Value::BigInt(text.parse().map_err(|e| err(&e))?),
            DataType::Real => Value::Real(text.parse().map_err(|e| err(&e))?),
            DataType::DoublePrecision => {
                Value::DoublePrecision(text.parse().map_err(|e| err(&e))?)
            }
            DataType::Char(n) => {
                if text.len() > *n as usize {
                    return Err(format!("'{}' is longer than {} bytes", text, n));
                }
                Value::Char(text.to_string())
            }
            DataType::Date => Value::Date(
                chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| err(&e))?,
            ),
            DataType::Timestamp => Value::Timestamp(
                chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                    .map_err(|e| err(&e))?,
            ),
            DataType::Uuid => Value::Uuid(text.parse().map_err(|e| err(&e))?),
        };
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::SmallInt(i) => write!(f, "{}", i),
            Value::Integer(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::DoublePrecision(d) => write!(f, "{}", d),
            Value::Char(s) => write!(f, "'{}'", s),
            Value::Date(d) => write!(f, "'{}'", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "'{}'", ts.format("%Y-%m-%d %H:%M:%S")),
            Value::Uuid(u) => write!(f, "'{}'", u),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Record descriptor of a table: an ordered list of fixed-width columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema with generated column names (`f0`, `f1`, ...).
    pub fn from_types(types: impl IntoIterator<Item = DataType>) -> Self {
        types
            .into_iter()
            .enumerate()
            .fold(Self::new(), |schema, (i, ty)| {
                schema.add_column(ColumnDefinition::new(format!("f{}", i), ty))
            })
    }

    pub fn add_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|col| col.name == name)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn types(&self) -> impl Iterator<Item = DataType> + '_ {
        self.columns.iter().map(|col| col.data_type)
    }

    /// Size in bytes of one record of this schema.
    pub fn record_size(&self) -> usize {
        self.types().map(|ty| ty.size()).sum()
    }

    /// Two schemas describe the same records when their column types match
    /// position by position; column names are not part of the record image.
    pub fn same_types(&self, other: &Schema) -> bool {
        self.columns.len() == other.columns.len() && self.types().eq(other.types())
    }

    pub fn validate_values(&self, values: &[Value]) -> Result<(), String> {
        if values.len() != self.columns.len() {
            return Err(format!(
                "expected {} values, got {}",
                self.columns.len(),
                values.len()
            ));
        }
        for (column, value) in self.columns.iter().zip(values) {
            if !value.type_compatible(&column.data_type) {
                return Err(format!(
                    "Type mismatch for column '{}': expected {}, got {}",
                    column.name,
                    column.data_type,
                    value.data_type()
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", col.name, col.data_type)?;
        }
        write!(f, ")")
    }
}

/// Address of one page: the owning storage file and the page's position in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub file_id: u32,
    pub page_number: u32,
}

impl PageId {
    pub fn new(file_id: u32, page_number: u32) -> Self {
        Self {
            file_id,
            page_number,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_number)
    }
}

/// Location of a record: page plus slot within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.page_id, self.slot)
    }
}

/// A record: values laid out according to `schema`, plus its location once
/// it has been stored or read back.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    schema: Arc<Schema>,
    values: Vec<Value>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Self {
        Self {
            schema,
            values,
            record_id: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, record_id: Option<RecordId>) {
        self.record_id = record_id;
    }

    pub fn with_record_id(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, val) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{}", val)?;
        }
        Ok(())
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a transaction. Every call to [`TransactionId::new`] yields a
/// value never handed out before in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}
