//! An in-memory `Serializer` implementation used only by this crate's
//! integration tests, built purely against `obstree`'s public API (an
//! integration test binary is a separate crate and has no access to
//! anything crate-private).
//!
//! The wire format is a small tagged-record stream covering the scalar
//! types these tests exercise (`bool`, `i64`, `u64`, `f64`, `String`);
//! it is not meant to be a production format.

use std::any::{Any, TypeId};
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use obstree::{
    copy_primitive, for_each_persistent_value, Error, Node, PathBuf, Properties, Result,
    Serializer,
};

const ARCHIVE_VERSION: u32 = 1;

const TAG_END: u8 = 0;
const TAG_NODE: u8 = 1;
const TAG_VALUE: u8 = 2;

const TYPE_BOOL: u8 = 0;
const TYPE_I64: u8 = 1;
const TYPE_U64: u8 = 2;
const TYPE_F64: u8 = 3;
const TYPE_STRING: u8 = 4;

#[derive(Default)]
pub struct TestSerializer;

impl Serializer for TestSerializer {
    fn archive_version(&self) -> u32 {
        ARCHIVE_VERSION
    }

    fn write_tree(&self, root: &Node, sink: &mut dyn Write) -> Result<()> {
        write_u32(sink, ARCHIVE_VERSION)?;
        let base = root.path();
        write_nodes(root, &base, sink)?;
        for_each_persistent_value(root, |node, record| {
            let rel = relative(&base, &node.path()).child(record.name);
            let _ = write_value_record(sink, &rel, &record);
        });
        write_u8(sink, TAG_END)
    }

    fn read_tree(&self, source: &mut dyn Read, host: &Node) -> Result<()> {
        let version = read_u32(source)?;
        if version != ARCHIVE_VERSION {
            return Err(Error::VersionNotSupported(version));
        }
        loop {
            match read_u8(source)? {
                TAG_END => return Ok(()),
                TAG_NODE => {
                    let path = read_string(source)?;
                    host.get_data_node(&path, Properties::PERSISTENT)?;
                }
                TAG_VALUE => {
                    read_value_record(source, host)?;
                }
                other => {
                    return Err(Error::Serialization(format!("unknown record tag {other}")));
                }
            }
        }
    }

    fn copy_value(
        &self,
        type_id: TypeId,
        payload: &(dyn Any + Send + Sync),
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        copy_primitive(type_id, payload)
    }
}

fn relative(base: &PathBuf, full: &PathBuf) -> PathBuf {
    let skip = base.segments().count();
    let mut rel = PathBuf::root();
    for seg in full.segments().skip(skip) {
        rel = rel.child(seg);
    }
    rel
}

fn path_string(path: &PathBuf) -> String {
    path.segments()
        .map(obstree::escape)
        .collect::<Vec<_>>()
        .join("/")
}

fn write_nodes(node: &Node, base: &PathBuf, sink: &mut dyn Write) -> Result<()> {
    if !node.is_persistent() {
        return Ok(());
    }
    let rel = relative(base, &node.path());
    if !rel.is_root() {
        write_u8(sink, TAG_NODE)?;
        write_string(sink, &path_string(&rel))?;
    }
    for child in node.children() {
        write_nodes(&child, base, sink)?;
    }
    Ok(())
}

fn write_value_record(
    sink: &mut dyn Write,
    path: &PathBuf,
    record: &obstree::ValueRecord<'_>,
) -> Result<()> {
    write_u8(sink, TAG_VALUE)?;
    write_string(sink, &path_string(path))?;
    write_timestamp(sink, record.timestamp)?;
    write_payload(sink, record.type_id, record.payload)
}

fn write_payload(sink: &mut dyn Write, type_id: TypeId, payload: &(dyn Any + Send + Sync)) -> Result<()> {
    if type_id == TypeId::of::<bool>() {
        write_u8(sink, TYPE_BOOL)?;
        write_u8(sink, *payload.downcast_ref::<bool>().unwrap() as u8)
    } else if type_id == TypeId::of::<i64>() {
        write_u8(sink, TYPE_I64)?;
        write_i64(sink, *payload.downcast_ref::<i64>().unwrap())
    } else if type_id == TypeId::of::<u64>() {
        write_u8(sink, TYPE_U64)?;
        write_u64(sink, *payload.downcast_ref::<u64>().unwrap())
    } else if type_id == TypeId::of::<f64>() {
        write_u8(sink, TYPE_F64)?;
        write_u64(sink, payload.downcast_ref::<f64>().unwrap().to_bits())
    } else if type_id == TypeId::of::<String>() {
        write_u8(sink, TYPE_STRING)?;
        write_string(sink, payload.downcast_ref::<String>().unwrap())
    } else {
        Err(Error::Serialization(format!(
            "TestSerializer has no codec for {type_id:?}"
        )))
    }
}

fn read_value_record(source: &mut dyn Read, host: &Node) -> Result<()> {
    let path = read_string(source)?;
    let timestamp = read_timestamp(source)?;
    let _ = timestamp; // round-tripped via the fresh write_value timestamp instead
    match read_u8(source)? {
        TYPE_BOOL => {
            host.set_value(&path, read_u8(source)? != 0, Properties::PERSISTENT)?;
        }
        TYPE_I64 => {
            host.set_value(&path, read_i64(source)?, Properties::PERSISTENT)?;
        }
        TYPE_U64 => {
            host.set_value(&path, read_u64(source)?, Properties::PERSISTENT)?;
        }
        TYPE_F64 => {
            host.set_value(&path, f64::from_bits(read_u64(source)?), Properties::PERSISTENT)?;
        }
        TYPE_STRING => {
            host.set_value(&path, read_string(source)?, Properties::PERSISTENT)?;
        }
        other => return Err(Error::Serialization(format!("unknown payload tag {other}"))),
    }
    Ok(())
}

fn write_u8(sink: &mut dyn Write, v: u8) -> Result<()> {
    sink.write_all(&[v]).map_err(io_err)
}

fn write_u32(sink: &mut dyn Write, v: u32) -> Result<()> {
    sink.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_u64(sink: &mut dyn Write, v: u64) -> Result<()> {
    sink.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_i64(sink: &mut dyn Write, v: i64) -> Result<()> {
    sink.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_timestamp(sink: &mut dyn Write, ts: DateTime<Utc>) -> Result<()> {
    write_i64(sink, ts.timestamp_millis())
}

fn write_string(sink: &mut dyn Write, s: &str) -> Result<()> {
    write_u32(sink, s.len() as u32)?;
    sink.write_all(s.as_bytes()).map_err(io_err)
}

fn read_u8(source: &mut dyn Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    source.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf[0])
}

fn read_u32(source: &mut dyn Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    source.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(source: &mut dyn Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf).map_err(io_err)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(source: &mut dyn Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf).map_err(io_err)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_timestamp(source: &mut dyn Read) -> Result<DateTime<Utc>> {
    let millis = read_i64(source)?;
    Ok(Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now))
}

fn read_string(source: &mut dyn Read) -> Result<String> {
    let len = read_u32(source)? as usize;
    let mut buf = vec![0u8; len];
    source.read_exact(&mut buf).map_err(io_err)?;
    String::from_utf8(buf).map_err(|e| Error::Serialization(e.to_string()))
}

fn io_err(e: std::io::Error) -> Error {
    Error::Serialization(e.to_string())
}

/// Builds a fresh, unrelated tree for a test, with an inline dispatcher
/// (synchronous delivery, no maintenance thread gymnastics needed for
/// assertions) and a [`TestSerializer`].
#[allow(dead_code)]
pub fn test_tree(name: &str) -> Node {
    obstree::new_tree(
        name,
        Properties::PERSISTENT,
        obstree::DispatcherHost::new(),
        Arc::new(TestSerializer),
    )
    .expect("valid root name")
}
