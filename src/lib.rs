//! A crate for reading and writing xdata, a self-describing, typed,
//! compressed binary container format for hierarchical data.
//!
//! A stored container is a gzip-wrapped stream holding one tree of keyed
//! [`Record`]s, lists and primitives, followed by an optional SHA-256 digest.
//! Reads and writes go through typed [`ScalarKey`]s and [`ListKey`]s, and
//! user types travel through registered [`Converter`]s that map them to and
//! from records. Values that are shared inside one tree are written once and
//! referenced by stream offset everywhere else.
//!
//! Both the serializer and the deserializer are iterative: trees nested
//! hundreds of thousands of levels deep round-trip without exhausting the
//! call stack.
//!
//! ```
//! use std::sync::LazyLock;
//! use xdata::{ListKey, Record, ScalarKey};
//!
//! static NAME: LazyLock<ScalarKey<String>> = LazyLock::new(|| ScalarKey::new("name"));
//! static SPOKES: LazyLock<ListKey<i32>> = LazyLock::new(|| ListKey::new("spokes"));
//!
//! fn main() -> xdata::Result<()> {
//!     let mut root = Record::new();
//!     root.set_scalar(&NAME, "hub".to_owned());
//!     root.set_list(&SPOKES, vec![1, 2, 3]);
//!
//!     let mut container = Vec::new();
//!     xdata::store(&root, &mut container, &[])?;
//!     let loaded = xdata::load(container.as_slice(), &[])?;
//!     assert_eq!(root, loaded);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::missing_errors_doc)]
#![allow(ambiguous_associated_items)]

pub mod convert;
pub mod decode;
pub mod encode;
pub mod error;
mod io_utils;
pub mod key;
mod mutf8;
mod pool;
pub mod primitive;
pub mod record;
pub mod value;

pub use crate::{
    convert::{Converter, DateConverter, UrlConverter, TYPE_NAME_KEY},
    decode::{load, load_from_file, load_with, validate, validate_file, ChecksumPolicy, Decoder,
        LoadOptions},
    encode::{store, store_to_file, store_with, Encoder, StoreOptions, MAGIC},
    error::{Error, Result},
    key::{ListKey, ScalarKey},
    record::Record,
    value::{DomainValue, FieldType, Value},
};
