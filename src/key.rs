//! Typed key descriptors for record slots.
//!
//! A key names a slot inside a record and carries the element type as its
//! type parameter, so reads and writes through it are checked at compile
//! time. Keys are built once, at module initialization, and never change:
//!
//! ```
//! use std::sync::LazyLock;
//! use xdata::{ListKey, ScalarKey};
//!
//! static WHEELS: LazyLock<ScalarKey<i32>> =
//!     LazyLock::new(|| ScalarKey::with_default("wheels", 4));
//! static NICKNAMES: LazyLock<ListKey<String>> =
//!     LazyLock::new(|| ListKey::new("nicknames"));
//! ```

use std::marker::PhantomData;

use crate::value::FieldType;

/// Describes a single-value slot of element type `T`.
#[derive(Debug, Clone)]
pub struct ScalarKey<T: FieldType> {
    name: String,
    allow_null: bool,
    default: Option<T>,
}

impl<T: FieldType> ScalarKey<T> {
    /// Creates a non-nullable key without a default.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name, false, None)
    }

    /// Creates a key whose slot may hold null.
    pub fn nullable(name: impl Into<String>) -> Self {
        Self::build(name, true, None)
    }

    /// Creates a non-nullable key whose absent slot reads as `default`.
    pub fn with_default(name: impl Into<String>, default: T) -> Self {
        Self::build(name, false, Some(default))
    }

    fn build(name: impl Into<String>, allow_null: bool, default: Option<T>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "record keys must be non-empty");
        Self {
            name,
            allow_null,
            default,
        }
    }

    /// The name of the slot this key describes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the slot may hold null.
    pub fn allow_null(&self) -> bool {
        self.allow_null
    }

    /// The value an absent slot reads as, if any.
    pub fn default(&self) -> Option<&T> {
        self.default.as_ref()
    }
}

/// Describes a list slot with elements of type `T`.
///
/// Nullability applies to the list as a whole: an absent non-nullable list
/// reads as an empty list, an absent nullable one as null.
#[derive(Debug, Clone)]
pub struct ListKey<T: FieldType> {
    name: String,
    allow_null: bool,
    _element: PhantomData<fn() -> T>,
}

impl<T: FieldType> ListKey<T> {
    /// Creates a non-nullable list key.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name, false)
    }

    /// Creates a list key whose slot may hold null.
    pub fn nullable(name: impl Into<String>) -> Self {
        Self::build(name, true)
    }

    fn build(name: impl Into<String>, allow_null: bool) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "record keys must be non-empty");
        Self {
            name,
            allow_null,
            _element: PhantomData,
        }
    }

    /// The name of the slot this key describes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the slot may hold null.
    pub fn allow_null(&self) -> bool {
        self.allow_null
    }
}
