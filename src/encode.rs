//! Encoding trees into xdata containers.
//!
//! The serializer walks the root record with an explicit frame stack instead
//! of recursion: deeply nested lists of lists would otherwise exhaust the
//! call stack. The stack order also pins down when each record's offset is
//! assigned — at the instant its header tag is written — which is what makes
//! back-references resolvable on the read side.

use std::{
    borrow::Cow,
    collections::HashMap,
    fs::File,
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use flate2::{write::GzEncoder, Compression};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    convert::{Converter, ConverterRegistry, TYPE_NAME_KEY},
    io_utils::{CountingWriter, DigestWriter},
    mutf8, primitive,
    record::Record,
    value::{DomainValue, Value},
    Error, Result,
};

/// The five magic bytes opening every decompressed stream.
pub const MAGIC: &[u8; 5] = b"xdata";

/// The wire tag of a tree element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueTag {
    /// An absent value; no payload.
    Null = 0x00,
    /// A primitive tag byte and payload follow.
    Primitive = 0x01,
    /// A signed 32-bit element count and that many tagged values follow.
    List = 0x02,
    /// A signed 32-bit entry count and that many key/value pairs follow.
    Record = 0x03,
    /// The signed 64-bit offset of a previously written record follows.
    Reference = 0x04,
}

/// Options for storing a tree.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Whether to append the SHA-256 digest trailer. Defaults to `true`.
    pub add_checksum: bool,
    /// Whether a domain value without a converter is stored as null instead
    /// of failing the store. Defaults to `false`.
    pub ignore_missing: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            add_checksum: true,
            ignore_missing: false,
        }
    }
}

/// Stores `root` as a gzip-compressed, checksummed xdata container.
///
/// # Errors
/// Returns an error if a domain value in the tree has no converter among
/// `converters` or the built-ins, a value cannot be represented on the wire,
/// or writing fails.
pub fn store<W: io::Write>(
    root: &Record,
    writer: W,
    converters: &[Arc<dyn Converter>],
) -> Result<()> {
    store_with(root, writer, converters, StoreOptions::default())
}

/// Stores `root` with explicit [`StoreOptions`].
///
/// # Errors
/// As [`store`], except that missing converters are tolerated when
/// [`StoreOptions::ignore_missing`] is set.
pub fn store_with<W: io::Write>(
    root: &Record,
    writer: W,
    converters: &[Arc<dyn Converter>],
    options: StoreOptions,
) -> Result<()> {
    Encoder::with_options(writer, converters, options)?.encode(root)
}

/// Stores `root` to the file at `path`.
///
/// # Errors
/// As [`store`], or if the file cannot be created.
pub fn store_to_file(
    root: &Record,
    path: impl AsRef<Path>,
    converters: &[Arc<dyn Converter>],
) -> Result<()> {
    let file = File::create(path.as_ref()).map_err(|e| {
        Error::io(
            e,
            format!("creating file at path '{}'", path.as_ref().display()),
        )
    })?;
    store(root, io::BufWriter::new(file), converters)
}

/// Type for encoding one tree into an xdata container.
///
/// Construction writes the container magic; [`encode`](Self::encode) writes
/// the tree and the trailer and finishes the gzip stream, so an `Encoder`
/// produces exactly one container.
pub struct Encoder<W: io::Write> {
    writer: CountingWriter<DigestWriter<GzEncoder<W>>>,
    registry: ConverterRegistry,
    add_checksum: bool,
    ignore_missing: bool,
}

enum Frame<'a> {
    Record(RecordFrame<'a>),
    List(ListFrame<'a>),
}

/// A record being written. `identity` is the pointer identity its finished
/// offset is filed under: the domain value it was marshalled from, or the
/// record itself when the caller supplied it directly. The owner handle is
/// kept alive until the whole tree is written; identities in the offset map
/// must never dangle, or a recycled allocation could alias an old entry.
struct RecordFrame<'a> {
    entries: RecordEntries<'a>,
    total: usize,
    identity: Option<usize>,
    owner: Option<DomainValue>,
    offset: Option<u64>,
}

enum RecordEntries<'a> {
    Borrowed(indexmap::map::Iter<'a, String, Value>),
    Owned(indexmap::map::IntoIter<String, Value>),
}

impl<'a> RecordEntries<'a> {
    fn next(&mut self) -> Option<(Cow<'a, str>, ValueHandle<'a>)> {
        match self {
            Self::Borrowed(iter) => iter
                .next()
                .map(|(key, value)| (Cow::Borrowed(key.as_str()), ValueHandle::Borrowed(value))),
            Self::Owned(iter) => iter
                .next()
                .map(|(key, value)| (Cow::Owned(key), ValueHandle::Owned(value))),
        }
    }
}

struct ListFrame<'a> {
    items: ListItems<'a>,
    total: usize,
    header_written: bool,
}

enum ListItems<'a> {
    Borrowed(std::slice::Iter<'a, Value>),
    Owned(std::vec::IntoIter<Value>),
}

impl<'a> ListItems<'a> {
    fn next(&mut self) -> Option<ValueHandle<'a>> {
        match self {
            Self::Borrowed(iter) => iter.next().map(ValueHandle::Borrowed),
            Self::Owned(iter) => iter.next().map(ValueHandle::Owned),
        }
    }
}

/// A value about to be emitted: borrowed from the caller's tree, or owned by
/// the marshalled record it was taken out of.
enum ValueHandle<'a> {
    Borrowed(&'a Value),
    Owned(Value),
}

impl ValueHandle<'_> {
    fn as_value(&self) -> &Value {
        match self {
            Self::Borrowed(value) => value,
            Self::Owned(value) => value,
        }
    }
}

enum Step<'a> {
    Push(Frame<'a>),
    Pop,
    Continue,
}

impl<W: io::Write> Encoder<W> {
    /// Creates a new [`Encoder`] with default [`StoreOptions`] and writes the
    /// container magic.
    ///
    /// # Errors
    /// Returns an error if writing the magic fails.
    pub fn new(writer: W, converters: &[Arc<dyn Converter>]) -> Result<Self> {
        Self::with_options(writer, converters, StoreOptions::default())
    }

    /// Creates a new [`Encoder`] and writes the container magic.
    ///
    /// # Errors
    /// Returns an error if writing the magic fails.
    pub fn with_options(
        writer: W,
        converters: &[Arc<dyn Converter>],
        options: StoreOptions,
    ) -> Result<Self> {
        let gz = GzEncoder::new(writer, Compression::default());
        let mut digest = DigestWriter::new(gz);
        digest
            .write_all(MAGIC)
            .map_err(|e| Error::io(e, "writing container magic"))?;
        // positions are counted from the first byte after the magic; the
        // reader mirrors this, which is what makes reference offsets line up
        Ok(Self {
            writer: CountingWriter::new(digest),
            registry: ConverterRegistry::assemble(converters),
            add_checksum: options.add_checksum,
            ignore_missing: options.ignore_missing,
        })
    }

    /// Encodes `root`, writes the trailer and finishes the gzip stream.
    ///
    /// # Errors
    /// Returns [`Error::NoConverter`] for an unconvertible domain value
    /// unless `ignore_missing` is set, [`Error::Encode`] for values the wire
    /// format cannot represent, or an I/O error from the underlying writer.
    pub fn encode(mut self, root: &Record) -> Result<()> {
        self.encode_tree(root)?;
        self.finish()
    }

    fn encode_tree(&mut self, root: &Record) -> Result<()> {
        let mut offsets: HashMap<usize, u64> = HashMap::new();
        // owners of already-written records; alive until the tree is done so
        // their identities stay unique
        let mut retained: Vec<DomainValue> = Vec::new();
        let mut stack: Vec<Frame> = vec![Frame::Record(RecordFrame {
            entries: RecordEntries::Borrowed(root.entries()),
            total: root.len(),
            identity: Some(root as *const Record as usize),
            owner: None,
            offset: None,
        })];
        loop {
            let Some(top) = stack.last_mut() else {
                return Ok(());
            };
            match self.advance(top, &offsets)? {
                Step::Push(frame) => stack.push(frame),
                Step::Continue => {}
                Step::Pop => {
                    if let Some(Frame::Record(frame)) = stack.pop() {
                        if let (Some(identity), Some(offset)) = (frame.identity, frame.offset) {
                            offsets.insert(identity, offset);
                        }
                        retained.extend(frame.owner);
                    }
                }
            }
        }
    }

    fn advance<'a>(
        &mut self,
        frame: &mut Frame<'a>,
        offsets: &HashMap<usize, u64>,
    ) -> Result<Step<'a>> {
        match frame {
            Frame::Record(frame) => {
                if frame.offset.is_none() {
                    let offset = self.writer.position();
                    self.write_header(ValueTag::Record, frame.total, "writing record header")?;
                    frame.offset = Some(offset);
                }
                match frame.entries.next() {
                    Some((key, value)) => {
                        let encoded = mutf8::encode(&key)?;
                        self.write_bytes(&encoded, "writing record key")?;
                        self.emit(value, offsets)
                    }
                    None => Ok(Step::Pop),
                }
            }
            Frame::List(frame) => {
                if !frame.header_written {
                    self.write_header(ValueTag::List, frame.total, "writing list header")?;
                    frame.header_written = true;
                }
                match frame.items.next() {
                    Some(value) => self.emit(value, offsets),
                    None => Ok(Step::Pop),
                }
            }
        }
    }

    fn emit<'a>(
        &mut self,
        handle: ValueHandle<'a>,
        offsets: &HashMap<usize, u64>,
    ) -> Result<Step<'a>> {
        match handle.as_value() {
            Value::Null => {
                self.write_bytes(&[u8::from(ValueTag::Null)], "writing null value")?;
                return Ok(Step::Continue);
            }
            value if primitive::tag_of(value).is_some() => {
                self.write_bytes(&[u8::from(ValueTag::Primitive)], "writing primitive value")?;
                primitive::write(&mut self.writer, value)?;
                return Ok(Step::Continue);
            }
            Value::Domain(domain) => {
                if let Some(&offset) = offsets.get(&domain.identity()) {
                    self.write_reference(offset)?;
                    return Ok(Step::Continue);
                }
                let Some(converter) = self.registry.for_type(domain.target_type()).cloned() else {
                    if self.ignore_missing {
                        self.write_bytes(&[u8::from(ValueTag::Null)], "writing null value")?;
                        return Ok(Step::Continue);
                    }
                    return Err(Error::NoConverter(domain.type_label().to_owned()));
                };
                let mut record = converter.marshal(domain)?;
                record.insert_value(
                    TYPE_NAME_KEY.to_owned(),
                    Value::Str(converter.type_name().to_owned()),
                );
                return Ok(Step::Push(Frame::Record(RecordFrame {
                    total: record.len(),
                    identity: Some(domain.identity()),
                    owner: Some(domain.clone()),
                    entries: RecordEntries::Owned(record.into_fields().into_iter()),
                    offset: None,
                })));
            }
            _ => {}
        }
        // lists and records push a frame; their header is written on the
        // frame's first visit so the record offset is sampled there
        Ok(Step::Push(match handle {
            ValueHandle::Borrowed(Value::List(items)) => Frame::List(ListFrame {
                total: items.len(),
                items: ListItems::Borrowed(items.iter()),
                header_written: false,
            }),
            ValueHandle::Owned(Value::List(items)) => Frame::List(ListFrame {
                total: items.len(),
                items: ListItems::Owned(items.into_iter()),
                header_written: false,
            }),
            ValueHandle::Borrowed(Value::Record(record)) => Frame::Record(RecordFrame {
                total: record.len(),
                identity: Some(record as *const Record as usize),
                owner: None,
                entries: RecordEntries::Borrowed(record.entries()),
                offset: None,
            }),
            ValueHandle::Owned(Value::Record(record)) => Frame::Record(RecordFrame {
                total: record.len(),
                identity: None,
                owner: None,
                entries: RecordEntries::Owned(record.into_fields().into_iter()),
                offset: None,
            }),
            _ => unreachable!("inline values were emitted above"),
        }))
    }

    fn write_reference(&mut self, offset: u64) -> Result<()> {
        let offset = i64::try_from(offset)
            .map_err(|_| Error::encode(format!("record offset {offset} exceeds i64")))?;
        let mut bytes = [0; 9];
        bytes[0] = u8::from(ValueTag::Reference);
        bytes[1..].copy_from_slice(&offset.to_be_bytes());
        self.write_bytes(&bytes, "writing reference offset")
    }

    fn write_header(&mut self, tag: ValueTag, len: usize, context: &str) -> Result<()> {
        let len = i32::try_from(len)
            .map_err(|_| Error::encode(format!("{len} entries exceed the signed 32-bit count")))?;
        let mut bytes = [0; 5];
        bytes[0] = u8::from(tag);
        bytes[1..].copy_from_slice(&len.to_be_bytes());
        self.write_bytes(&bytes, context)
    }

    fn write_bytes(&mut self, bytes: &[u8], context: &str) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| Error::io(e, context))
    }

    fn finish(self) -> Result<()> {
        let mut digest = self.writer.into_inner();
        let gz = if self.add_checksum {
            digest
                .write_all(&[1])
                .map_err(|e| Error::io(e, "writing checksum flag"))?;
            let (sum, mut gz) = digest.finalize();
            gz.write_all(&sum)
                .map_err(|e| Error::io(e, "writing checksum"))?;
            gz
        } else {
            digest.into_inner()
        };
        gz.finish()
            .map_err(|e| Error::io(e, "finishing gzip stream"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        sync::{Arc, LazyLock},
    };

    use sha2::{Digest, Sha256};
    use time::{macros::datetime, OffsetDateTime};

    use super::*;
    use crate::key::ScalarKey;

    fn decompress(bytes: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut payload)
            .unwrap();
        payload
    }

    #[test]
    fn test_golden_layout_of_single_bool() {
        static B: LazyLock<ScalarKey<bool>> = LazyLock::new(|| ScalarKey::new("b"));
        let mut root = Record::new();
        root.set_scalar(&B, true);
        let mut buf = Vec::new();
        store_with(
            &root,
            &mut buf,
            &[],
            StoreOptions {
                add_checksum: false,
                ignore_missing: false,
            },
        )
        .unwrap();
        let payload = decompress(&buf);
        assert_eq!(
            payload,
            vec![
                b'x', b'd', b'a', b't', b'a', // magic
                0x03, 0x00, 0x00, 0x00, 0x01, // record, one entry
                0x00, 0x01, b'b', // key
                0x01, 0x00, 0x01, // primitive, bool, true
            ]
        );
    }

    #[test]
    fn test_checksum_covers_magic_through_flag() {
        static B: LazyLock<ScalarKey<bool>> = LazyLock::new(|| ScalarKey::new("b"));
        let mut root = Record::new();
        root.set_scalar(&B, true);
        let mut buf = Vec::new();
        store(&root, &mut buf, &[]).unwrap();
        let payload = decompress(&buf);
        let (covered, stored) = payload.split_at(payload.len() - 32);
        assert_eq!(*covered.last().unwrap(), 0x01);
        let computed: [u8; 32] = Sha256::digest(covered).into();
        assert_eq!(stored, computed.as_slice());
    }

    #[test]
    fn test_shared_domain_value_is_written_once() {
        static A: LazyLock<ScalarKey<Arc<OffsetDateTime>>> =
            LazyLock::new(|| ScalarKey::new("a"));
        static B: LazyLock<ScalarKey<Arc<OffsetDateTime>>> =
            LazyLock::new(|| ScalarKey::new("b"));
        let date = Arc::new(datetime!(2015-05-15 12:30:45 UTC));
        let mut root = Record::new();
        root.set_scalar(&A, Arc::clone(&date));
        root.set_scalar(&B, date);
        let mut buf = Vec::new();
        store_with(
            &root,
            &mut buf,
            &[],
            StoreOptions {
                add_checksum: false,
                ignore_missing: false,
            },
        )
        .unwrap();
        let payload = decompress(&buf);
        let timestamp_keys = payload
            .windows(b"timestamp".len())
            .filter(|&window| window == b"timestamp".as_slice())
            .count();
        assert_eq!(timestamp_keys, 1);
        // the date record sits right after the root header and the key "a":
        // position 8 counted from the end of the magic
        let reference = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08];
        assert!(payload
            .windows(reference.len())
            .any(|window| window == reference.as_slice()));
    }

    #[test]
    fn test_missing_converter_fails_or_nulls() {
        static SLOT: LazyLock<ScalarKey<Arc<u64>>> = LazyLock::new(|| ScalarKey::new("slot"));
        let mut root = Record::new();
        root.set_scalar(&SLOT, Arc::new(5_u64));
        let mut buf = Vec::new();
        let res = store(&root, &mut buf, &[]);
        assert!(matches!(res, Err(Error::NoConverter(name)) if name.contains("u64")));

        let mut buf = Vec::new();
        store_with(
            &root,
            &mut buf,
            &[],
            StoreOptions {
                add_checksum: true,
                ignore_missing: true,
            },
        )
        .unwrap();
        let payload = decompress(&buf);
        // key "slot" followed by a bare null tag
        let expected = [0x00, 0x04, b's', b'l', b'o', b't', 0x00];
        assert!(payload
            .windows(expected.len())
            .any(|window| window == expected.as_slice()));
    }
}
