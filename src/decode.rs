//! Decoding xdata containers back into trees.
//!
//! The deserializer mirrors the writer: an explicit frame stack instead of
//! recursion, and an offset map filled as each record finishes so that
//! references resolve against exactly the coordinate space the writer used.
//! Converters run bottom-up, on frame completion, once a marshalled record is
//! whole.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
    sync::Arc,
};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::{
    convert::{Converter, ConverterRegistry, TYPE_NAME_KEY},
    encode::{ValueTag, MAGIC},
    io_utils::{read_exact_or_truncated, read_u16_be, CountingReader, DigestReader},
    mutf8, pool,
    primitive::{self, PrimitiveTag},
    record::Record,
    value::Value,
    Error, Result,
};

/// What the reader does about the digest trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Ignore the trailer entirely.
    None,
    /// Verify the digest when the stream carries a complete one; tolerate its
    /// absence.
    #[default]
    IfAvailable,
    /// Require a complete, matching digest.
    Required,
}

/// Options for loading a tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// How to treat the digest trailer.
    pub checksum_policy: ChecksumPolicy,
    /// Whether a marshalled record whose type name has no converter is kept
    /// as a raw record instead of failing the load. Defaults to `false`.
    pub ignore_missing: bool,
}

/// Loads a tree from a gzip-compressed xdata container.
///
/// # Errors
/// Returns an error if the stream is corrupt or truncated, the root is not a
/// record, a marshalled record has no converter among `converters` and the
/// built-ins, or the digest trailer violates the default
/// [`ChecksumPolicy::IfAvailable`] policy.
pub fn load<R: io::Read>(reader: R, converters: &[Arc<dyn Converter>]) -> Result<Record> {
    load_with(reader, converters, LoadOptions::default())
}

/// Loads a tree with explicit [`LoadOptions`].
///
/// # Errors
/// As [`load`], except that missing converters are tolerated when
/// [`LoadOptions::ignore_missing`] is set and the checksum discipline follows
/// [`LoadOptions::checksum_policy`].
pub fn load_with<R: io::Read>(
    reader: R,
    converters: &[Arc<dyn Converter>],
    options: LoadOptions,
) -> Result<Record> {
    Decoder::with_options(reader, converters, options)?.decode()
}

/// Loads a tree from the file at `path`.
///
/// # Errors
/// As [`load`], or if the file cannot be opened.
pub fn load_from_file(path: impl AsRef<Path>, converters: &[Arc<dyn Converter>]) -> Result<Record> {
    let file = open_file(path.as_ref())?;
    load(BufReader::new(file), converters)
}

/// Reads the whole stream and reports whether its embedded digest matches.
///
/// Unlike [`load`] with [`ChecksumPolicy::Required`], this never fails on
/// content corruption; it returns `false` for a mismatch and for streams that
/// carry no digest at all.
///
/// # Errors
/// Returns an error only if reading or decompressing the stream fails.
pub fn validate<R: io::Read>(reader: R) -> Result<bool> {
    let mut payload = Vec::new();
    GzDecoder::new(reader)
        .read_to_end(&mut payload)
        .map_err(|e| Error::io(e, "decompressing stream for validation"))?;
    // magic, at least one tag byte, the presence flag and the digest
    if payload.len() < MAGIC.len() + 1 + 1 + 32 || !payload.starts_with(MAGIC) {
        return Ok(false);
    }
    let (covered, stored) = payload.split_at(payload.len() - 32);
    if covered[covered.len() - 1] != 0x01 {
        return Ok(false);
    }
    let computed: [u8; 32] = Sha256::digest(covered).into();
    Ok(computed.as_slice() == stored)
}

/// Validates the digest of the file at `path`; see [`validate`].
///
/// # Errors
/// Returns an error only if the file cannot be opened or read.
pub fn validate_file(path: impl AsRef<Path>) -> Result<bool> {
    let file = open_file(path.as_ref())?;
    validate(BufReader::new(file))
}

fn open_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::io(e, format!("opening file at path '{}'", path.display())))
}

/// Type for decoding one xdata container into a tree.
///
/// Construction consumes and checks the container magic;
/// [`decode`](Self::decode) reads the tree and the trailer.
pub struct Decoder<R: io::Read> {
    reader: CountingReader<DigestReader<GzDecoder<R>>>,
    registry: ConverterRegistry,
    checksum_policy: ChecksumPolicy,
    ignore_missing: bool,
}

enum Frame {
    Record(RecordFrame),
    List(ListFrame),
}

struct RecordFrame {
    total: usize,
    consumed: usize,
    /// Offset of the record's tag byte; the coordinate references use.
    offset: u64,
    fields: Record,
    pending_key: Option<String>,
}

struct ListFrame {
    total: usize,
    items: Vec<Value>,
}

impl Frame {
    fn is_complete(&self) -> bool {
        match self {
            Frame::Record(frame) => frame.consumed == frame.total,
            Frame::List(frame) => frame.items.len() == frame.total,
        }
    }

    fn accept(&mut self, value: Value) {
        match self {
            Frame::Record(frame) => {
                let key = frame
                    .pending_key
                    .take()
                    .expect("a record frame accepts a child only after its key");
                frame.fields.insert_value(key, value);
                frame.consumed += 1;
            }
            Frame::List(frame) => frame.items.push(value),
        }
    }
}

/// The outcome of reading one tagged element: an inline value, or a frame
/// pushed for a nested list or record.
enum Step {
    Inline(Value),
    Pushed,
}

impl<R: io::Read> Decoder<R> {
    /// Creates a new [`Decoder`] with default [`LoadOptions`] and consumes
    /// the container magic.
    ///
    /// # Errors
    /// Returns [`Error::BadMagic`] if the stream does not open with the xdata
    /// magic bytes, or an error if reading fails.
    pub fn new(reader: R, converters: &[Arc<dyn Converter>]) -> Result<Self> {
        Self::with_options(reader, converters, LoadOptions::default())
    }

    /// Creates a new [`Decoder`] and consumes the container magic.
    ///
    /// # Errors
    /// As [`new`](Self::new).
    pub fn with_options(
        reader: R,
        converters: &[Arc<dyn Converter>],
        options: LoadOptions,
    ) -> Result<Self> {
        let mut digest = DigestReader::new(GzDecoder::new(reader));
        let mut magic = [0; MAGIC.len()];
        read_exact_or_truncated(&mut digest, &mut magic, "reading container magic")?;
        if &magic != MAGIC {
            return Err(Error::BadMagic);
        }
        Ok(Self {
            reader: CountingReader::new(digest),
            registry: ConverterRegistry::assemble(converters),
            checksum_policy: options.checksum_policy,
            ignore_missing: options.ignore_missing,
        })
    }

    /// Decodes the tree and verifies the trailer against the checksum policy.
    ///
    /// # Errors
    /// Returns a decoding error for corrupt or truncated input,
    /// [`Error::BadRoot`] if the root value is not a record,
    /// [`Error::NoConverter`] for an unknown type name unless
    /// `ignore_missing` is set, and [`Error::ChecksumMissing`] or
    /// [`Error::ChecksumMismatch`] per the policy.
    pub fn decode(mut self) -> Result<Record> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut offsets: HashMap<u64, Value> = HashMap::new();

        match self.decode_element(&mut stack, &offsets)? {
            Step::Pushed if matches!(stack.last(), Some(Frame::Record(_))) => {}
            _ => return Err(Error::BadRoot),
        }

        let mut root = None;
        while !stack.is_empty() {
            let complete = stack.last().map(Frame::is_complete).unwrap_or_default();
            if complete {
                let frame = stack.pop().expect("loop condition checked non-empty");
                let value = self.finish_frame(frame, &mut offsets)?;
                match stack.last_mut() {
                    Some(parent) => parent.accept(value),
                    None => root = Some(value),
                }
                continue;
            }
            if let Some(Frame::Record(frame)) = stack.last() {
                if frame.pending_key.is_none() {
                    let key = self.read_key()?;
                    if let Some(Frame::Record(frame)) = stack.last_mut() {
                        frame.pending_key = Some(key);
                    }
                }
            }
            if let Step::Inline(value) = self.decode_element(&mut stack, &offsets)? {
                stack
                    .last_mut()
                    .expect("loop condition checked non-empty")
                    .accept(value);
            }
        }

        let record = match root {
            Some(Value::Record(record)) => record,
            // a converter turned the root into a domain value
            _ => return Err(Error::BadRoot),
        };
        self.read_trailer()?;
        Ok(record)
    }

    fn decode_element(
        &mut self,
        stack: &mut Vec<Frame>,
        offsets: &HashMap<u64, Value>,
    ) -> Result<Step> {
        let offset = self.reader.position();
        let tag_byte = self.read_byte("reading value tag")?;
        let tag = ValueTag::try_from(tag_byte).map_err(|_| Error::UnknownValueTag(tag_byte))?;
        match tag {
            ValueTag::Null => Ok(Step::Inline(Value::Null)),
            ValueTag::Primitive => {
                let prim_byte = self.read_byte("reading primitive tag")?;
                let prim_tag = PrimitiveTag::try_from(prim_byte)
                    .map_err(|_| Error::UnknownPrimitiveTag(prim_byte))?;
                Ok(Step::Inline(primitive::read(&mut self.reader, prim_tag)?))
            }
            ValueTag::List => {
                let total = self.read_count("reading list length")?;
                stack.push(Frame::List(ListFrame {
                    total,
                    // the count is untrusted until the elements parse
                    items: Vec::with_capacity(total.min(1024)),
                }));
                Ok(Step::Pushed)
            }
            ValueTag::Record => {
                let total = self.read_count("reading record entry count")?;
                stack.push(Frame::Record(RecordFrame {
                    total,
                    consumed: 0,
                    offset,
                    fields: pool::acquire(),
                    pending_key: None,
                }));
                Ok(Step::Pushed)
            }
            ValueTag::Reference => {
                let mut buf = [0; 8];
                read_exact_or_truncated(&mut self.reader, &mut buf, "reading reference offset")?;
                let target = i64::from_be_bytes(buf);
                if target < 0 {
                    return Err(Error::decode(format!("negative reference offset {target}")));
                }
                match offsets.get(&(target as u64)) {
                    Some(value) => Ok(Step::Inline(value.clone())),
                    None => Err(Error::DanglingReference(target)),
                }
            }
        }
    }

    fn finish_frame(&mut self, frame: Frame, offsets: &mut HashMap<u64, Value>) -> Result<Value> {
        let frame = match frame {
            Frame::List(frame) => return Ok(Value::List(frame.items)),
            Frame::Record(frame) => frame,
        };
        let type_name = match frame.fields.value(TYPE_NAME_KEY) {
            Some(Value::Str(name)) => Some(name.clone()),
            _ => None,
        };
        let Some(type_name) = type_name else {
            // plain records cannot be the target of a reference: they are
            // owned by their slot and have no identity to share
            return Ok(Value::Record(frame.fields));
        };
        match self.registry.for_name(&type_name) {
            Some(converter) => {
                let domain = converter.unmarshal(&frame.fields)?;
                pool::release(frame.fields);
                let value = Value::Domain(domain);
                offsets.insert(frame.offset, value.clone());
                Ok(value)
            }
            None if self.ignore_missing => {
                let value = Value::Record(frame.fields);
                offsets.insert(frame.offset, value.clone());
                Ok(value)
            }
            None => Err(Error::NoConverter(type_name)),
        }
    }

    fn read_key(&mut self) -> Result<String> {
        const CONTEXT: &str = "reading record key";
        let len = read_u16_be(&mut self.reader, CONTEXT)? as usize;
        let mut buf = vec![0; len];
        read_exact_or_truncated(&mut self.reader, &mut buf, CONTEXT)?;
        mutf8::decode(&buf)
    }

    fn read_byte(&mut self, context: &str) -> Result<u8> {
        let mut buf = [0; 1];
        read_exact_or_truncated(&mut self.reader, &mut buf, context)?;
        Ok(buf[0])
    }

    fn read_count(&mut self, context: &str) -> Result<usize> {
        let mut buf = [0; 4];
        read_exact_or_truncated(&mut self.reader, &mut buf, context)?;
        let count = i32::from_be_bytes(buf);
        usize::try_from(count).map_err(|_| Error::decode(format!("negative count {count}")))
    }

    fn read_trailer(self) -> Result<()> {
        if self.checksum_policy == ChecksumPolicy::None {
            return Ok(());
        }
        let mut digest = self.reader.into_inner();
        let flag = match read_optional_byte(&mut digest)? {
            None => {
                return match self.checksum_policy {
                    ChecksumPolicy::Required => Err(Error::ChecksumMissing),
                    _ => Ok(()),
                };
            }
            Some(flag) => flag,
        };
        if flag != 0x01 {
            // the position where the retired trailing class registry of very
            // old streams would begin
            return Err(Error::UnknownValueTag(flag));
        }
        let (computed, mut inner) = digest.finalize();
        let mut stored = [0; 32];
        if let Err(e) = inner.read_exact(&mut stored) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return match self.checksum_policy {
                    ChecksumPolicy::Required => Err(Error::ChecksumMissing),
                    // a partial trailer is treated as no trailer at all
                    _ => Ok(()),
                };
            }
            return Err(Error::io(e, "reading checksum"));
        }
        if computed == stored {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch)
        }
    }
}

fn read_optional_byte<R: io::Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut buf = [0; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::io(e, "reading checksum flag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::LazyLock};

    use flate2::{write::GzEncoder, Compression};
    use rstest::rstest;

    use super::*;
    use crate::{encode, key::ScalarKey};

    /// Compresses a hand-built decompressed payload back into a container.
    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn decompress(bytes: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut payload).unwrap();
        payload
    }

    fn empty_record_payload() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x00]);
        payload
    }

    #[test]
    fn test_bad_magic() {
        let res = load(gzip(b"xdatb\x03\x00\x00\x00\x00").as_slice(), &[]);
        assert!(matches!(res, Err(Error::BadMagic)));
    }

    #[rstest]
    #[case::primitive(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x05])]
    #[case::null(&[0x00])]
    #[case::list(&[0x02, 0x00, 0x00, 0x00, 0x00])]
    fn test_root_must_be_a_record(#[case] root: &[u8]) {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(root);
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::BadRoot)));
    }

    #[test]
    fn test_unknown_value_tag() {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'k', 0x09]);
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::UnknownValueTag(0x09))));
    }

    #[test]
    fn test_unknown_primitive_tag() {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'k', 0x01, 0x09]);
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::UnknownPrimitiveTag(0x09))));
    }

    #[test]
    fn test_dangling_reference() {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'k', 0x04]);
        payload.extend_from_slice(&77_i64.to_be_bytes());
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::DanglingReference(77))));
    }

    #[test]
    fn test_negative_list_length() {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'k', 0x02]);
        payload.extend_from_slice(&(-4_i32).to_be_bytes());
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::Decode(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        // a record announcing one entry whose value never arrives
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'k', 0x01, 0x05]);
        payload.extend_from_slice(&[0x00, 0x00]);
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::TruncatedStream(_))));
    }

    #[test]
    fn test_trailer_with_unknown_convention_is_rejected() {
        let mut payload = empty_record_payload();
        payload.push(0x07);
        let res = load(gzip(&payload).as_slice(), &[]);
        assert!(matches!(res, Err(Error::UnknownValueTag(0x07))));
        // but the trailer is never even read when the policy says so
        let res = load_with(
            gzip(&payload).as_slice(),
            &[],
            LoadOptions {
                checksum_policy: ChecksumPolicy::None,
                ignore_missing: false,
            },
        );
        assert!(res.is_ok());
    }

    #[rstest]
    #[case::tolerated(ChecksumPolicy::IfAvailable, true)]
    #[case::ignored(ChecksumPolicy::None, true)]
    #[case::required(ChecksumPolicy::Required, false)]
    fn test_missing_checksum_per_policy(#[case] policy: ChecksumPolicy, #[case] ok: bool) {
        let container = gzip(&empty_record_payload());
        let res = load_with(
            container.as_slice(),
            &[],
            LoadOptions {
                checksum_policy: policy,
                ignore_missing: false,
            },
        );
        if ok {
            assert!(res.is_ok());
        } else {
            assert!(matches!(res, Err(Error::ChecksumMissing)));
        }
    }

    #[test]
    fn test_truncated_checksum_per_policy() {
        let mut payload = empty_record_payload();
        payload.push(0x01);
        payload.extend_from_slice(&[0xab; 16]);
        let container = gzip(&payload);
        assert!(load(container.as_slice(), &[]).is_ok());
        let res = load_with(
            container.as_slice(),
            &[],
            LoadOptions {
                checksum_policy: ChecksumPolicy::Required,
                ignore_missing: false,
            },
        );
        assert!(matches!(res, Err(Error::ChecksumMissing)));
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        static NUM: LazyLock<ScalarKey<i64>> = LazyLock::new(|| ScalarKey::new("num"));
        let mut root = Record::new();
        root.set_scalar(&NUM, 786_783_647_846_876_879);
        let mut container = Vec::new();
        encode::store(&root, &mut container, &[]).unwrap();
        assert!(validate(container.as_slice()).unwrap());

        let mut payload = decompress(&container);
        // flip a byte inside the i64 payload so the tree still parses
        payload[20] ^= 0xff;
        let tampered = gzip(&payload);
        assert!(!validate(tampered.as_slice()).unwrap());
        let res = load_with(
            tampered.as_slice(),
            &[],
            LoadOptions {
                checksum_policy: ChecksumPolicy::Required,
                ignore_missing: false,
            },
        );
        assert!(matches!(res, Err(Error::ChecksumMismatch)));
        // the default policy verifies a present checksum too
        let res = load(tampered.as_slice(), &[]);
        assert!(matches!(res, Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_validate_without_checksum_is_false() {
        static NUM: LazyLock<ScalarKey<i64>> = LazyLock::new(|| ScalarKey::new("num"));
        let mut root = Record::new();
        root.set_scalar(&NUM, 5);
        let mut container = Vec::new();
        encode::store_with(
            &root,
            &mut container,
            &[],
            encode::StoreOptions {
                add_checksum: false,
                ignore_missing: false,
            },
        )
        .unwrap();
        assert!(!validate(container.as_slice()).unwrap());
    }

    #[test]
    fn test_unknown_type_name_per_ignore_missing() {
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        // root with one entry "k" holding a marshalled record of an
        // unregistered type
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'k']);
        payload.extend_from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01]);
        payload.extend_from_slice(&[0x00, 0x0f]);
        payload.extend_from_slice(b"_meta_classname");
        payload.extend_from_slice(&[0x01, 0x08, 0x00, 0x0d]);
        payload.extend_from_slice(b"xdata.mystery");
        let container = gzip(&payload);

        let res = load(container.as_slice(), &[]);
        assert!(matches!(res, Err(Error::NoConverter(name)) if name == "xdata.mystery"));

        let root = load_with(
            container.as_slice(),
            &[],
            LoadOptions {
                checksum_policy: ChecksumPolicy::IfAvailable,
                ignore_missing: true,
            },
        )
        .unwrap();
        let raw = root.value("k").unwrap();
        assert!(matches!(raw, Value::Record(r) if r.contains_key(TYPE_NAME_KEY)));
    }
}
