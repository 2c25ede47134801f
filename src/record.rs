//! The keyed record, the structural node of every tree.

use std::fmt;

use indexmap::IndexMap;

use crate::{
    key::{ListKey, ScalarKey},
    value::{FieldType, Value},
    Error, Result,
};

/// An ordered mapping from string keys to values.
///
/// Records are the fundamental structural node: every stored tree has a
/// record at its root, and records nest to arbitrary depth. Keys are unique
/// within a record and iteration preserves insertion order across a store and
/// load round trip.
///
/// Reads and writes go through typed [`ScalarKey`]s and [`ListKey`]s, which
/// carry the element type, nullability and optional default for a slot.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of slots in this record.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether this record has no slots.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether a slot named `key` exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// The raw value stored under `key`, if any.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Iterates over the slot names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub(crate) fn entries(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub(crate) fn insert_value(&mut self, key: String, value: Value) {
        self.fields.insert(key, value);
    }

    pub(crate) fn into_fields(mut self) -> IndexMap<String, Value> {
        std::mem::take(&mut self.fields)
    }

    /// Stores `value` under the scalar `key`, replacing any previous value.
    pub fn set_scalar<T: FieldType>(&mut self, key: &ScalarKey<T>, value: T) {
        self.fields
            .insert(key.name().to_owned(), value.into_value());
    }

    /// Stores an explicit null under the scalar `key`.
    ///
    /// # Errors
    /// Returns [`Error::NullNotAllowed`] if the key is non-nullable.
    pub fn set_scalar_null<T: FieldType>(&mut self, key: &ScalarKey<T>) -> Result<()> {
        if !key.allow_null() {
            return Err(Error::NullNotAllowed(key.name().to_owned()));
        }
        self.fields.insert(key.name().to_owned(), Value::Null);
        Ok(())
    }

    /// Reads the value under the scalar `key`.
    ///
    /// An absent slot reads as the key's default, which may itself be absent.
    /// A stored null reads as `None` on a nullable key.
    ///
    /// # Errors
    /// Returns [`Error::NullNotAllowed`] for a stored null on a non-nullable
    /// key and [`Error::TypeMismatch`] if the stored value does not have the
    /// shape `T` describes.
    pub fn get_scalar<T: FieldType>(&self, key: &ScalarKey<T>) -> Result<Option<T>> {
        match self.fields.get(key.name()) {
            None => Ok(key.default().cloned()),
            Some(Value::Null) => {
                if key.allow_null() {
                    Ok(None)
                } else {
                    Err(Error::NullNotAllowed(key.name().to_owned()))
                }
            }
            Some(value) => match T::from_value(value) {
                Some(extracted) => Ok(Some(extracted)),
                None => Err(self.mismatch(key.name(), T::type_label(), value)),
            },
        }
    }

    /// Reads the value under the scalar `key`, requiring the slot to exist.
    ///
    /// # Errors
    /// Returns [`Error::MissingKey`] if the slot is absent, even when the key
    /// has a default; [`Error::NullNotAllowed`] for a stored null (a null can
    /// never satisfy a mandatory read); [`Error::TypeMismatch`] as
    /// [`get_scalar`](Self::get_scalar).
    pub fn get_mandatory_scalar<T: FieldType>(&self, key: &ScalarKey<T>) -> Result<T> {
        match self.fields.get(key.name()) {
            None => Err(Error::MissingKey(key.name().to_owned())),
            Some(Value::Null) => Err(Error::NullNotAllowed(key.name().to_owned())),
            Some(value) => T::from_value(value)
                .ok_or_else(|| self.mismatch(key.name(), T::type_label(), value)),
        }
    }

    /// Stores `values` under the list `key`, replacing any previous value.
    pub fn set_list<T: FieldType>(&mut self, key: &ListKey<T>, values: Vec<T>) {
        self.fields.insert(
            key.name().to_owned(),
            Value::List(values.into_iter().map(FieldType::into_value).collect()),
        );
    }

    /// Stores an explicit null under the list `key`.
    ///
    /// # Errors
    /// Returns [`Error::NullNotAllowed`] if the key is non-nullable.
    pub fn set_list_null<T: FieldType>(&mut self, key: &ListKey<T>) -> Result<()> {
        if !key.allow_null() {
            return Err(Error::NullNotAllowed(key.name().to_owned()));
        }
        self.fields.insert(key.name().to_owned(), Value::Null);
        Ok(())
    }

    /// Reads the list under `key`.
    ///
    /// An absent non-nullable list reads as an empty list; an absent nullable
    /// list reads as `None`, as does a stored null on a nullable key.
    ///
    /// # Errors
    /// Returns [`Error::NullNotAllowed`] for a stored null on a non-nullable
    /// key and [`Error::TypeMismatch`] if the slot is not a list or an
    /// element does not have the shape `T` describes.
    pub fn get_list<T: FieldType>(&self, key: &ListKey<T>) -> Result<Option<Vec<T>>> {
        match self.fields.get(key.name()) {
            None => {
                if key.allow_null() {
                    Ok(None)
                } else {
                    Ok(Some(Vec::new()))
                }
            }
            Some(Value::Null) => {
                if key.allow_null() {
                    Ok(None)
                } else {
                    Err(Error::NullNotAllowed(key.name().to_owned()))
                }
            }
            Some(value) => self
                .extract_list(key.name(), value)
                .map(Some),
        }
    }

    /// Reads the list under `key`, requiring the slot to exist.
    ///
    /// # Errors
    /// Returns [`Error::MissingKey`] if the slot is absent;
    /// [`Error::NullNotAllowed`] for a stored null; otherwise as
    /// [`get_list`](Self::get_list).
    pub fn get_mandatory_list<T: FieldType>(&self, key: &ListKey<T>) -> Result<Vec<T>> {
        match self.fields.get(key.name()) {
            None => Err(Error::MissingKey(key.name().to_owned())),
            Some(Value::Null) => Err(Error::NullNotAllowed(key.name().to_owned())),
            Some(value) => self.extract_list(key.name(), value),
        }
    }

    fn extract_list<T: FieldType>(&self, key: &str, value: &Value) -> Result<Vec<T>> {
        let Value::List(items) = value else {
            return Err(self.mismatch(key, "list", value));
        };
        items
            .iter()
            .map(|item| {
                T::from_value(item).ok_or_else(|| self.mismatch(key, T::type_label(), item))
            })
            .collect()
    }

    fn mismatch(&self, key: &str, expected: &'static str, actual: &Value) -> Error {
        Error::TypeMismatch {
            key: key.to_owned(),
            expected,
            actual: actual.kind(),
        }
    }

    /// Removes every slot, flattening nested records and lists iteratively so
    /// that arbitrarily deep trees tear down without exhausting the stack.
    pub fn clear(&mut self) {
        if self.fields.is_empty() {
            return;
        }
        let mut pending: Vec<Value> = self.fields.drain(..).map(|(_, value)| value).collect();
        while let Some(value) = pending.pop() {
            match value {
                Value::List(mut items) => pending.append(&mut items),
                Value::Record(mut record) => {
                    pending.extend(record.fields.drain(..).map(|(_, value)| value));
                }
                _ => {}
            }
        }
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Equality compares the underlying mapping by content.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

/// A fixed-indent tree rendering, useful for golden output in tests. Not part
/// of the wire contract.
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_record(self, f, 0)
    }
}

fn fmt_record(record: &Record, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    writeln!(f, "{{")?;
    for (key, value) in record.entries() {
        write!(f, "{:indent$}  {key} = ", "", indent = indent)?;
        fmt_value(value, f, indent + 2)?;
        writeln!(f)?;
    }
    write!(f, "{:indent$}}}", "", indent = indent)
}

fn fmt_value(value: &Value, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(v) => write!(f, "{v}"),
        Value::I8(v) => write!(f, "{v}"),
        Value::Char(v) => write!(f, "'{v}'"),
        Value::I16(v) => write!(f, "{v}"),
        Value::I32(v) => write!(f, "{v}"),
        Value::I64(v) => write!(f, "{v}"),
        Value::F32(v) => write!(f, "{v}"),
        Value::F64(v) => write!(f, "{v}"),
        Value::Str(v) => write!(f, "\"{v}\""),
        Value::Domain(v) => write!(f, "{v:?}"),
        Value::List(items) => {
            writeln!(f, "[")?;
            for item in items {
                write!(f, "{:indent$}  ", "", indent = indent)?;
                fmt_value(item, f, indent + 2)?;
                writeln!(f)?;
            }
            write!(f, "{:indent$}]", "", indent = indent)
        }
        Value::Record(record) => fmt_record(record, f, indent),
    }
}
