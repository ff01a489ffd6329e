//! Binary primitives for structural records.
//!
//! Big-endian fixed-width integers and length-prefixed UTF-8 strings
//! (`u16` byte length followed by the bytes).

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::id::{NodeIdentity, SessionOperationId};

pub fn write_utf<W: Write>(out: &mut W, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Codec(format!("string of {} bytes is too long", value.len())))?;
    out.write_u16::<BigEndian>(len)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

pub fn read_utf<R: Read>(input: &mut R) -> Result<String> {
    let len = input.read_u16::<BigEndian>().map_err(truncated)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes).map_err(truncated)?;
    String::from_utf8(bytes).map_err(|e| Error::Codec(format!("invalid UTF-8: {}", e)))
}

pub fn write_i32<W: Write>(out: &mut W, value: i32) -> Result<()> {
    out.write_i32::<BigEndian>(value)?;
    Ok(())
}

pub fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    input.read_i32::<BigEndian>().map_err(truncated)
}

pub fn write_session_operation_id<W: Write>(out: &mut W, id: &SessionOperationId) -> Result<()> {
    write_utf(out, &id.node_id)?;
    let sequential = i64::try_from(id.sequential)
        .map_err(|_| Error::Codec(format!("sequential {} out of range", id.sequential)))?;
    out.write_i64::<BigEndian>(sequential)?;
    Ok(())
}

pub fn read_session_operation_id<R: Read>(input: &mut R) -> Result<SessionOperationId> {
    let node_id = read_utf(input)?;
    let sequential = input.read_i64::<BigEndian>().map_err(truncated)?;
    let sequential = u64::try_from(sequential)
        .map_err(|_| Error::Codec(format!("negative sequential {}", sequential)))?;
    Ok(SessionOperationId::new(node_id, sequential))
}

pub fn write_node_identity<W: Write>(out: &mut W, identity: &NodeIdentity) -> Result<()> {
    write_utf(out, &identity.id)?;
    write_utf(out, &identity.name)
}

pub fn read_node_identity<R: Read>(input: &mut R) -> Result<NodeIdentity> {
    let id = read_utf(input)?;
    let name = read_utf(input)?;
    Ok(NodeIdentity::new(id, name))
}

fn truncated(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Codec("record truncated".into())
    } else {
        Error::Io(e)
    }
}
