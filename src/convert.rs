//! Converters marshal user types to and from records.
//!
//! A converter owns the mapping between one domain type and its record form.
//! When the serializer meets a [`DomainValue`] it looks the converter up by
//! the value's [`TypeId`], calls [`Converter::marshal`] and stamps the
//! converter's type name into the record under [`TYPE_NAME_KEY`]. The
//! deserializer reverses the lookup by that name and calls
//! [`Converter::unmarshal`] once the record is fully materialized.

use std::{
    any::TypeId,
    collections::{HashMap, VecDeque},
    sync::{Arc, LazyLock},
};

use time::OffsetDateTime;
use url::Url;

use crate::{
    key::ScalarKey,
    record::Record,
    value::DomainValue,
    Error, Result,
};

/// The reserved record key carrying the converter type name.
pub const TYPE_NAME_KEY: &str = "_meta_classname";

/// Marshals one domain type to and from its record form.
///
/// Converters are stateless and must be reentrant: one store or load call may
/// invoke the same converter for many values. The type name is the stable
/// identity of the mapping on the wire; the convention `xdata.<project>.<name>`
/// keeps it stable across refactors of the Rust type.
pub trait Converter: Send + Sync {
    /// The stable name written into marshalled records.
    fn type_name(&self) -> &str;

    /// The domain type this converter handles.
    fn target_type(&self) -> TypeId;

    /// Converters this one depends on; the registry includes them
    /// transitively, so callers only need to pass their top-level converters.
    fn required_converters(&self) -> Vec<Arc<dyn Converter>> {
        Vec::new()
    }

    /// Builds the record form of `value`.
    ///
    /// # Errors
    /// Returns an error if `value` is not of the target type or cannot be
    /// represented as a record.
    fn marshal(&self, value: &DomainValue) -> Result<Record>;

    /// Rebuilds the domain value from its record form.
    ///
    /// # Errors
    /// Returns an error if the record lacks the slots the mapping requires.
    fn unmarshal(&self, record: &Record) -> Result<DomainValue>;
}

/// The converter lookup table assembled for one store or load call.
///
/// The write side is keyed by [`TypeId`] (matching the runtime type of domain
/// values), the read side by type name (matching [`TYPE_NAME_KEY`] in decoded
/// records). User converters are inserted before the built-in date and URL
/// converters, so a user converter that claims the same type or name wins.
pub(crate) struct ConverterRegistry {
    by_type: HashMap<TypeId, Arc<dyn Converter>>,
    by_name: HashMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    pub(crate) fn assemble(user: &[Arc<dyn Converter>]) -> Self {
        let mut registry = Self {
            by_type: HashMap::new(),
            by_name: HashMap::new(),
        };
        let mut pending: VecDeque<Arc<dyn Converter>> = user.iter().cloned().collect();
        pending.push_back(Arc::new(DateConverter));
        pending.push_back(Arc::new(UrlConverter));
        while let Some(converter) = pending.pop_front() {
            // a converter already present under both keys has been expanded;
            // skipping it keeps dependency cycles finite
            if registry.insert(converter.clone()) {
                pending.extend(converter.required_converters());
            }
        }
        registry
    }

    fn insert(&mut self, converter: Arc<dyn Converter>) -> bool {
        let mut fresh = false;
        self.by_type
            .entry(converter.target_type())
            .or_insert_with(|| {
                fresh = true;
                Arc::clone(&converter)
            });
        self.by_name
            .entry(converter.type_name().to_owned())
            .or_insert_with(|| {
                fresh = true;
                converter
            });
        fresh
    }

    pub(crate) fn for_type(&self, target: TypeId) -> Option<&Arc<dyn Converter>> {
        self.by_type.get(&target)
    }

    pub(crate) fn for_name(&self, name: &str) -> Option<&Arc<dyn Converter>> {
        self.by_name.get(name)
    }
}

static TIMESTAMP: LazyLock<ScalarKey<i64>> = LazyLock::new(|| ScalarKey::new("timestamp"));

/// The built-in converter for [`OffsetDateTime`], stored as a millisecond
/// Unix timestamp under the key `timestamp`.
#[derive(Debug, Clone, Copy)]
pub struct DateConverter;

impl Converter for DateConverter {
    fn type_name(&self) -> &str {
        "xdata.date"
    }

    fn target_type(&self) -> TypeId {
        TypeId::of::<OffsetDateTime>()
    }

    fn marshal(&self, value: &DomainValue) -> Result<Record> {
        let date = value
            .downcast_ref::<OffsetDateTime>()
            .ok_or_else(|| Error::encode("date converter applied to a non-date value"))?;
        let millis = i64::try_from(date.unix_timestamp_nanos() / 1_000_000)
            .map_err(|_| Error::encode("timestamp too far from the epoch for milliseconds"))?;
        let mut record = Record::new();
        record.set_scalar(&TIMESTAMP, millis);
        Ok(record)
    }

    fn unmarshal(&self, record: &Record) -> Result<DomainValue> {
        let millis = record.get_mandatory_scalar(&TIMESTAMP)?;
        let date = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .map_err(|e| Error::decode(format!("timestamp out of range: {e}")))?;
        Ok(DomainValue::new(date))
    }
}

static URL_STRING: LazyLock<ScalarKey<String>> = LazyLock::new(|| ScalarKey::new("url_string"));

/// The built-in converter for [`Url`], stored in external form under the key
/// `url_string`.
#[derive(Debug, Clone, Copy)]
pub struct UrlConverter;

impl Converter for UrlConverter {
    fn type_name(&self) -> &str {
        // the name existing xdata streams carry for URL values
        "java.net.URL"
    }

    fn target_type(&self) -> TypeId {
        TypeId::of::<Url>()
    }

    fn marshal(&self, value: &DomainValue) -> Result<Record> {
        let url = value
            .downcast_ref::<Url>()
            .ok_or_else(|| Error::encode("URL converter applied to a non-URL value"))?;
        let mut record = Record::new();
        record.set_scalar(&URL_STRING, url.as_str().to_owned());
        Ok(record)
    }

    fn unmarshal(&self, record: &Record) -> Result<DomainValue> {
        let raw = record.get_mandatory_scalar(&URL_STRING)?;
        let url = Url::parse(&raw).map_err(|e| Error::decode(format!("invalid URL '{raw}': {e}")))?;
        Ok(DomainValue::new(url))
    }
}
