//! The symbol stream: the external, on-disk encoding of debug records
//! (spec §6 external interfaces). An external tool is responsible for
//! producing it from a kernel's debug info; this module only reads (and,
//! for round-tripping in tests, writes) the wire format and feeds the
//! result through [`TypeGraph::add`].
//!
//! A little-endian, length-prefixed binary stream, in the style `vmem.rs`
//! already reads dump primitives in: a fixed header carrying a major/minor
//! version tag, followed by a flat sequence of tagged records. The major
//! version gates compatibility outright (`FatalError::IncompatibleSymbolVersion`);
//! within a major version, an older minor only omits tail fields this reader
//! fills in with their `Default` — new trailing fields never make an old
//! stream unreadable.

use std::io::{self, ErrorKind, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::{EngineError, FatalError, TypeError};
use crate::symbol::Interner;
use crate::types::{AggregateKind, ConstantValue, DebugRecord, MemberRecord, RecordBody, TypeGraph, TypeId};

/// 4-byte magic prefixing every stream, so a misdirected file (a rule
/// catalogue, a slab listing) is rejected immediately instead of
/// misparsing into garbage records.
pub const MAGIC: [u8; 4] = *b"VMI1";

/// The only major version this reader understands. A stream declaring a
/// different major is rejected outright; there is no forward-compatible
/// reading of a newer major.
pub const MAJOR: u16 = 1;

/// The newest minor version this writer emits. A reader accepts any minor
/// at this major, filling fields introduced after the stream's declared
/// minor with `Default::default()`.
pub const MINOR: u16 = 1;

/// Minor version at which a record first carries its `compile_unit` tail
/// field. Streams declaring an older minor never carry the byte at all;
/// it must not be read off the wire.
const MINOR_COMPILE_UNIT: u16 = 1;

/// The header every symbol stream opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub major: u16,
    pub minor: u16,
}

fn io_err(msg: impl Into<String>) -> EngineError {
    EngineError::Type(TypeError::MalformedSymbol(msg.into()))
}

fn write_opt_string<W: Write>(w: &mut W, s: Option<&str>) -> io::Result<()> {
    match s {
        Some(s) => {
            w.write_u8(1)?;
            let bytes = s.as_bytes();
            w.write_u32::<LE>(bytes.len() as u32)?;
            w.write_all(bytes)
        }
        None => w.write_u8(0),
    }
}

fn read_opt_string<R: Read>(r: &mut R) -> Result<Option<String>, EngineError> {
    match r.read_u8().map_err(EngineError::Io)? {
        0 => Ok(None),
        1 => {
            let len = r.read_u32::<LE>().map_err(EngineError::Io)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).map_err(EngineError::Io)?;
            String::from_utf8(buf).map(Some).map_err(|e| io_err(format!("non-utf8 string: {e}")))
        }
        tag => Err(io_err(format!("bad option tag {tag}"))),
    }
}

fn write_opt_u32<W: Write>(w: &mut W, v: Option<u32>) -> io::Result<()> {
    match v {
        Some(v) => {
            w.write_u8(1)?;
            w.write_u32::<LE>(v)
        }
        None => w.write_u8(0),
    }
}

fn read_opt_u32<R: Read>(r: &mut R) -> Result<Option<u32>, EngineError> {
    match r.read_u8().map_err(EngineError::Io)? {
        0 => Ok(None),
        1 => r.read_u32::<LE>().map(Some).map_err(EngineError::Io),
        tag => Err(io_err(format!("bad option tag {tag}"))),
    }
}

fn write_constant<W: Write>(w: &mut W, c: &ConstantValue) -> io::Result<()> {
    match c {
        ConstantValue::Int(v) => {
            w.write_u8(0)?;
            w.write_i128::<LE>(*v)
        }
        ConstantValue::Str(s) => {
            w.write_u8(1)?;
            let bytes = s.as_bytes();
            w.write_u32::<LE>(bytes.len() as u32)?;
            w.write_all(bytes)
        }
    }
}

fn read_constant<R: Read>(r: &mut R) -> Result<ConstantValue, EngineError> {
    match r.read_u8().map_err(EngineError::Io)? {
        0 => r.read_i128::<LE>().map(ConstantValue::Int).map_err(EngineError::Io),
        1 => {
            let len = r.read_u32::<LE>().map_err(EngineError::Io)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).map_err(EngineError::Io)?;
            String::from_utf8(buf).map(ConstantValue::Str).map_err(|e| io_err(format!("non-utf8 constant: {e}")))
        }
        tag => Err(io_err(format!("bad constant tag {tag}"))),
    }
}

fn write_member<W: Write>(w: &mut W, m: &MemberRecord) -> io::Result<()> {
    write_opt_string(w, m.name.as_deref())?;
    w.write_u64::<LE>(m.offset)?;
    w.write_i64::<LE>(m.referent)?;
    write_opt_u32(w, m.bit_size)?;
    write_opt_u32(w, m.bit_offset)?;
    w.write_u32::<LE>(m.observed_constants.len() as u32)?;
    for c in &m.observed_constants {
        write_constant(w, c)?;
    }
    Ok(())
}

fn read_member<R: Read>(r: &mut R) -> Result<MemberRecord, EngineError> {
    let name = read_opt_string(r)?;
    let offset = r.read_u64::<LE>().map_err(EngineError::Io)?;
    let referent = r.read_i64::<LE>().map_err(EngineError::Io)?;
    let bit_size = read_opt_u32(r)?;
    let bit_offset = read_opt_u32(r)?;
    let constant_count = r.read_u32::<LE>().map_err(EngineError::Io)?;
    let mut observed_constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        observed_constants.push(read_constant(r)?);
    }
    Ok(MemberRecord { name, offset, referent, bit_size, bit_offset, observed_constants })
}

/// Record tags. Stable across minor versions within a major; a new tag may
/// only be introduced alongside a major bump, since an old reader would
/// otherwise silently misparse an unrecognised one.
const TAG_INT: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_ENUM: u8 = 4;
const TAG_POINTER: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_STRUCT: u8 = 7;
const TAG_UNION: u8 = 8;
const TAG_TYPEDEF: u8 = 9;
const TAG_CONST: u8 = 10;
const TAG_VOLATILE: u8 = 11;
const TAG_FUNCTION_POINTER: u8 = 12;
const TAG_VOID: u8 = 13;
const TAG_VARIABLE: u8 = 14;

/// Writes one record: the fixed attributes every record carries
/// (`id`, `name`, `size`), the tag-specific payload, then — for a writer
/// declaring [`MINOR_COMPILE_UNIT`] or newer — the `compile_unit` tail
/// field.
pub fn write_record<W: Write>(w: &mut W, record: &DebugRecord, minor: u16) -> io::Result<()> {
    w.write_i64::<LE>(record.id)?;
    write_opt_string(w, record.name.as_deref())?;
    w.write_u64::<LE>(record.size)?;
    match &record.body {
        RecordBody::Int { bits, signed } => {
            w.write_u8(TAG_INT)?;
            w.write_u8(*bits)?;
            w.write_u8(u8::from(*signed))?;
        }
        RecordBody::Bool { bits } => {
            w.write_u8(TAG_BOOL)?;
            w.write_u8(*bits)?;
        }
        RecordBody::Float => w.write_u8(TAG_FLOAT)?,
        RecordBody::Double => w.write_u8(TAG_DOUBLE)?,
        RecordBody::Void => w.write_u8(TAG_VOID)?,
        RecordBody::Enum { underlying, variants } => {
            w.write_u8(TAG_ENUM)?;
            w.write_i64::<LE>(*underlying)?;
            w.write_u32::<LE>(variants.len() as u32)?;
            for (name, value) in variants {
                let bytes = name.as_bytes();
                w.write_u32::<LE>(bytes.len() as u32)?;
                w.write_all(bytes)?;
                w.write_i64::<LE>(*value)?;
            }
        }
        RecordBody::Pointer { referent } => {
            w.write_u8(TAG_POINTER)?;
            w.write_i64::<LE>(*referent)?;
        }
        RecordBody::Array { referent, len } => {
            w.write_u8(TAG_ARRAY)?;
            w.write_i64::<LE>(*referent)?;
            match len {
                Some(len) => {
                    w.write_u8(1)?;
                    w.write_u64::<LE>(*len)?;
                }
                None => w.write_u8(0)?,
            }
        }
        RecordBody::Aggregate { kind, members } => {
            w.write_u8(if *kind == AggregateKind::Struct { TAG_STRUCT } else { TAG_UNION })?;
            w.write_u32::<LE>(members.len() as u32)?;
            for m in members {
                write_member(w, m)?;
            }
        }
        RecordBody::Typedef { referent } => {
            w.write_u8(TAG_TYPEDEF)?;
            w.write_i64::<LE>(*referent)?;
        }
        RecordBody::Const { referent } => {
            w.write_u8(TAG_CONST)?;
            w.write_i64::<LE>(*referent)?;
        }
        RecordBody::Volatile { referent } => {
            w.write_u8(TAG_VOLATILE)?;
            w.write_i64::<LE>(*referent)?;
        }
        RecordBody::FunctionPointer { return_ty, params } => {
            w.write_u8(TAG_FUNCTION_POINTER)?;
            w.write_i64::<LE>(*return_ty)?;
            w.write_u32::<LE>(params.len() as u32)?;
            for p in params {
                w.write_i64::<LE>(*p)?;
            }
        }
        RecordBody::Variable { referent, address } => {
            w.write_u8(TAG_VARIABLE)?;
            w.write_i64::<LE>(*referent)?;
            w.write_u64::<LE>(*address)?;
        }
    }
    if minor >= MINOR_COMPILE_UNIT {
        write_opt_string(w, record.compile_unit.as_deref())?;
    }
    Ok(())
}

/// Reads one record. `stream_minor` governs whether the `compile_unit`
/// tail field is present on the wire; when it isn't, the field defaults to
/// `None` rather than being read.
pub fn read_record<R: Read>(r: &mut R, stream_minor: u16) -> Result<DebugRecord, EngineError> {
    let id = r.read_i64::<LE>().map_err(EngineError::Io)?;
    let name = read_opt_string(r)?;
    let size = r.read_u64::<LE>().map_err(EngineError::Io)?;
    let tag = r.read_u8().map_err(EngineError::Io)?;
    let body = match tag {
        TAG_INT => {
            let bits = r.read_u8().map_err(EngineError::Io)?;
            let signed = r.read_u8().map_err(EngineError::Io)? != 0;
            RecordBody::Int { bits, signed }
        }
        TAG_BOOL => RecordBody::Bool { bits: r.read_u8().map_err(EngineError::Io)? },
        TAG_FLOAT => RecordBody::Float,
        TAG_DOUBLE => RecordBody::Double,
        TAG_VOID => RecordBody::Void,
        TAG_ENUM => {
            let underlying = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let count = r.read_u32::<LE>().map_err(EngineError::Io)?;
            let mut variants = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = r.read_u32::<LE>().map_err(EngineError::Io)? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf).map_err(EngineError::Io)?;
                let name = String::from_utf8(buf).map_err(|e| io_err(format!("non-utf8 variant: {e}")))?;
                let value = r.read_i64::<LE>().map_err(EngineError::Io)?;
                variants.push((name, value));
            }
            RecordBody::Enum { underlying, variants }
        }
        TAG_POINTER => RecordBody::Pointer { referent: r.read_i64::<LE>().map_err(EngineError::Io)? },
        TAG_ARRAY => {
            let referent = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let len = match r.read_u8().map_err(EngineError::Io)? {
                0 => None,
                _ => Some(r.read_u64::<LE>().map_err(EngineError::Io)?),
            };
            RecordBody::Array { referent, len }
        }
        TAG_STRUCT | TAG_UNION => {
            let count = r.read_u32::<LE>().map_err(EngineError::Io)?;
            let mut members = Vec::with_capacity(count as usize);
            for _ in 0..count {
                members.push(read_member(r)?);
            }
            let kind = if tag == TAG_STRUCT { AggregateKind::Struct } else { AggregateKind::Union };
            RecordBody::Aggregate { kind, members }
        }
        TAG_TYPEDEF => RecordBody::Typedef { referent: r.read_i64::<LE>().map_err(EngineError::Io)? },
        TAG_CONST => RecordBody::Const { referent: r.read_i64::<LE>().map_err(EngineError::Io)? },
        TAG_VOLATILE => RecordBody::Volatile { referent: r.read_i64::<LE>().map_err(EngineError::Io)? },
        TAG_FUNCTION_POINTER => {
            let return_ty = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let count = r.read_u32::<LE>().map_err(EngineError::Io)?;
            let mut params = Vec::with_capacity(count as usize);
            for _ in 0..count {
                params.push(r.read_i64::<LE>().map_err(EngineError::Io)?);
            }
            RecordBody::FunctionPointer { return_ty, params }
        }
        TAG_VARIABLE => {
            let referent = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let address = r.read_u64::<LE>().map_err(EngineError::Io)?;
            RecordBody::Variable { referent, address }
        }
        other => return Err(io_err(format!("unknown record tag {other}"))),
    };
    let compile_unit = if stream_minor >= MINOR_COMPILE_UNIT { read_opt_string(r)? } else { None };
    Ok(DebugRecord { id, name, size, body, compile_unit })
}

/// Writes a whole stream: the header at the writer's current
/// [`MAJOR`]/[`MINOR`], then one record per entry of `records`.
pub fn write_stream<W: Write>(w: &mut W, records: &[DebugRecord]) -> io::Result<()> {
    w.write_all(&MAGIC)?;
    w.write_u16::<LE>(MAJOR)?;
    w.write_u16::<LE>(MINOR)?;
    for record in records {
        write_record(w, record, MINOR)?;
    }
    Ok(())
}

/// Reads a stream's header, checking the magic and major version. Returns
/// the header so the caller can report the minor version it found.
pub fn read_header<R: Read>(r: &mut R) -> Result<StreamHeader, EngineError> {
    let mut magic = [0u8; 4];
    match r.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(EngineError::Fatal(FatalError::TruncatedHeader)),
        Err(e) => return Err(EngineError::Io(e)),
    }
    if magic != MAGIC {
        return Err(io_err(format!("symbol stream magic mismatch: got {}", hex::encode(magic))));
    }
    let major = r.read_u16::<LE>().map_err(EngineError::Io)?;
    let minor = r.read_u16::<LE>().map_err(EngineError::Io)?;
    if major != MAJOR {
        return Err(EngineError::Fatal(FatalError::IncompatibleSymbolVersion { major, minor }));
    }
    Ok(StreamHeader { major, minor })
}

/// Reads a whole stream and ingests every record into `graph`, in the
/// order they appear. Does not call [`TypeGraph::resolve`] — a caller that
/// ingests several stream segments (say, one per compile unit) should only
/// resolve once, after the last one.
pub fn ingest_symbol_stream<R: Read>(mut r: R, graph: &mut TypeGraph, interner: &mut Interner) -> Result<StreamHeader, EngineError> {
    let header = read_header(&mut r)?;
    let mut count = 0u64;
    loop {
        let mut probe = [0u8; 1];
        match r.read(&mut probe) {
            Ok(0) => break,
            Ok(_) => {
                let record = read_one_from_prefix(&mut r, probe[0], header.minor)?;
                graph.add(record, interner)?;
                count += 1;
            }
            Err(e) => return Err(EngineError::Io(e)),
        }
    }
    tracing::debug!(records = count, major = header.major, minor = header.minor, "ingested symbol stream");
    Ok(header)
}

/// `read_record` assumes the `id` field is the first thing on the wire;
/// ingestion already peeked one byte off the stream to detect end-of-file,
/// so this stitches that byte back on as the low byte of `id` before
/// delegating to the normal little-endian reader.
fn read_one_from_prefix<R: Read>(r: &mut R, first_byte: u8, stream_minor: u16) -> Result<DebugRecord, EngineError> {
    let mut rest = [0u8; 7];
    r.read_exact(&mut rest).map_err(EngineError::Io)?;
    let mut id_bytes = [0u8; 8];
    id_bytes[0] = first_byte;
    id_bytes[1..].copy_from_slice(&rest);
    let id = i64::from_le_bytes(id_bytes);
    let name = read_opt_string(r)?;
    let size = r.read_u64::<LE>().map_err(EngineError::Io)?;
    let tag = r.read_u8().map_err(EngineError::Io)?;
    let body = read_body(r, tag)?;
    let compile_unit = if stream_minor >= MINOR_COMPILE_UNIT { read_opt_string(r)? } else { None };
    Ok(DebugRecord { id, name, size, body, compile_unit })
}

fn read_body<R: Read>(r: &mut R, tag: u8) -> Result<RecordBody, EngineError> {
    match tag {
        TAG_INT => {
            let bits = r.read_u8().map_err(EngineError::Io)?;
            let signed = r.read_u8().map_err(EngineError::Io)? != 0;
            Ok(RecordBody::Int { bits, signed })
        }
        TAG_BOOL => Ok(RecordBody::Bool { bits: r.read_u8().map_err(EngineError::Io)? }),
        TAG_FLOAT => Ok(RecordBody::Float),
        TAG_DOUBLE => Ok(RecordBody::Double),
        TAG_VOID => Ok(RecordBody::Void),
        TAG_ENUM => {
            let underlying = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let count = r.read_u32::<LE>().map_err(EngineError::Io)?;
            let mut variants = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = r.read_u32::<LE>().map_err(EngineError::Io)? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf).map_err(EngineError::Io)?;
                let name = String::from_utf8(buf).map_err(|e| io_err(format!("non-utf8 variant: {e}")))?;
                let value = r.read_i64::<LE>().map_err(EngineError::Io)?;
                variants.push((name, value));
            }
            Ok(RecordBody::Enum { underlying, variants })
        }
        TAG_POINTER => Ok(RecordBody::Pointer { referent: r.read_i64::<LE>().map_err(EngineError::Io)? }),
        TAG_ARRAY => {
            let referent = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let len = match r.read_u8().map_err(EngineError::Io)? {
                0 => None,
                _ => Some(r.read_u64::<LE>().map_err(EngineError::Io)?),
            };
            Ok(RecordBody::Array { referent, len })
        }
        TAG_STRUCT | TAG_UNION => {
            let count = r.read_u32::<LE>().map_err(EngineError::Io)?;
            let mut members = Vec::with_capacity(count as usize);
            for _ in 0..count {
                members.push(read_member(r)?);
            }
            let kind = if tag == TAG_STRUCT { AggregateKind::Struct } else { AggregateKind::Union };
            Ok(RecordBody::Aggregate { kind, members })
        }
        TAG_TYPEDEF => Ok(RecordBody::Typedef { referent: r.read_i64::<LE>().map_err(EngineError::Io)? }),
        TAG_CONST => Ok(RecordBody::Const { referent: r.read_i64::<LE>().map_err(EngineError::Io)? }),
        TAG_VOLATILE => Ok(RecordBody::Volatile { referent: r.read_i64::<LE>().map_err(EngineError::Io)? }),
        TAG_FUNCTION_POINTER => {
            let return_ty = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let count = r.read_u32::<LE>().map_err(EngineError::Io)?;
            let mut params = Vec::with_capacity(count as usize);
            for _ in 0..count {
                params.push(r.read_i64::<LE>().map_err(EngineError::Io)?);
            }
            Ok(RecordBody::FunctionPointer { return_ty, params })
        }
        TAG_VARIABLE => {
            let referent = r.read_i64::<LE>().map_err(EngineError::Io)?;
            let address = r.read_u64::<LE>().map_err(EngineError::Io)?;
            Ok(RecordBody::Variable { referent, address })
        }
        other => Err(io_err(format!("unknown record tag {other}"))),
    }
}
