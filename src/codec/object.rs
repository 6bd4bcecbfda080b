//! Encoding of whole object records.
//!
//! ```text
//! magic "obj\x01" | objnum
//! parents   count, objnum*
//! children  count, objnum*
//! vars      count, (name, class, value)*
//! methods   present(0|1) [count, method*]
//! strings   count, string*
//! idents    count, string*
//! name      present(0|1) [string]
//! ```
//!
//! A deleted record has its first four bytes replaced by [`TOMBSTONE`].
//! Decoding ignores bytes after the record, since extents are block-rounded.

use super::value::{decode_value, encode_value, value_size};
use super::varint::{
    read_len, read_long, read_long_list, read_opt_long, read_string, size_long,
    size_long_list, size_string, write_long, write_long_list, write_opt_long, write_string,
};
use crate::object::{Method, ObjectRecord, Objnum, VarKey};
use crate::storage::error::{StoreError, StoreResult};
use crate::value::InstanceRegistry;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

pub const OBJECT_MAGIC: [u8; 4] = *b"obj\x01";
pub const TOMBSTONE: [u8; 4] = *b"DEAD";

pub fn encode_object(record: &ObjectRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(object_size(record));
    out.put_slice(&OBJECT_MAGIC);
    write_long(&mut out, record.objnum);
    write_long_list(&mut out, &record.parents);
    write_long_list(&mut out, &record.children);

    write_long(&mut out, record.vars.len() as i64);
    for (key, value) in &record.vars {
        write_string(&mut out, &key.name);
        write_long(&mut out, key.class);
        encode_value(&mut out, value);
    }

    match &record.methods {
        Some(methods) => {
            write_long(&mut out, 1);
            write_long(&mut out, methods.len() as i64);
            for method in methods {
                encode_method(&mut out, method);
            }
        }
        None => write_long(&mut out, 0),
    }

    write_string_table(&mut out, &record.strings);
    write_string_table(&mut out, &record.idents);

    match &record.name {
        Some(name) => {
            write_long(&mut out, 1);
            write_string(&mut out, name);
        }
        None => write_long(&mut out, 0),
    }
    out
}

/// Exact length of [`encode_object`]'s output, computed without encoding.
pub fn object_size(record: &ObjectRecord) -> usize {
    let vars: usize = record
        .vars
        .iter()
        .map(|(key, value)| size_string(&key.name) + size_long(key.class) + value_size(value))
        .sum();
    let methods = match &record.methods {
        Some(methods) => {
            1 + size_long(methods.len() as i64) + methods.iter().map(method_size).sum::<usize>()
        }
        None => 1,
    };
    let name = match &record.name {
        Some(name) => 1 + size_string(name),
        None => 1,
    };

    OBJECT_MAGIC.len()
        + size_long(record.objnum)
        + size_long_list(&record.parents)
        + size_long_list(&record.children)
        + size_long(record.vars.len() as i64)
        + vars
        + methods
        + string_table_size(&record.strings)
        + string_table_size(&record.idents)
        + name
}

pub fn decode_object(bytes: &[u8], registry: &InstanceRegistry) -> StoreResult<ObjectRecord> {
    let mut buf = bytes;
    if buf.remaining() < OBJECT_MAGIC.len() {
        return Err(StoreError::Corrupt("record shorter than header".to_string()));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic == TOMBSTONE {
        return Err(StoreError::Corrupt("record is tombstoned".to_string()));
    }
    if magic != OBJECT_MAGIC {
        return Err(StoreError::Corrupt(format!("bad record magic {:?}", magic)));
    }

    let objnum: Objnum = read_long(&mut buf)?;
    let mut record = ObjectRecord::new(objnum, read_long_list(&mut buf)?);
    record.children = read_long_list(&mut buf)?;

    let var_count = read_len(&mut buf)?;
    let mut vars = BTreeMap::new();
    for _ in 0..var_count {
        let name = read_string(&mut buf)?;
        let class = read_long(&mut buf)?;
        let value = decode_value(&mut buf, registry)?;
        vars.insert(VarKey { class, name }, value);
    }
    record.vars = vars;

    if read_flag(&mut buf)? {
        let count = read_len(&mut buf)?;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(decode_method(&mut buf)?);
        }
        record.methods = Some(methods);
    }

    record.strings = read_string_table(&mut buf)?;
    record.idents = read_string_table(&mut buf)?;

    if read_flag(&mut buf)? {
        record.name = Some(read_string(&mut buf)?);
    }
    Ok(record)
}

fn read_flag(buf: &mut impl Buf) -> StoreResult<bool> {
    match read_long(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(StoreError::Corrupt(format!("bad presence flag {}", n))),
    }
}

fn write_string_table(out: &mut Vec<u8>, table: &[String]) {
    write_long(out, table.len() as i64);
    for s in table {
        write_string(out, s);
    }
}

fn string_table_size(table: &[String]) -> usize {
    size_long(table.len() as i64) + table.iter().map(|s| size_string(s)).sum::<usize>()
}

fn read_string_table(buf: &mut impl Buf) -> StoreResult<Vec<String>> {
    let count = read_len(buf)?;
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        table.push(read_string(buf)?);
    }
    Ok(table)
}

fn encode_method(out: &mut Vec<u8>, method: &Method) {
    write_string(out, &method.name);
    write_long(out, method.flags);
    write_long(out, method.access);
    write_opt_long(out, method.native);
    write_long_list(out, &method.args);
    write_opt_long(out, method.rest);
    write_long_list(out, &method.vars);
    write_long_list(out, &method.opcodes);
    write_long(out, method.error_lists.len() as i64);
    for list in &method.error_lists {
        write_long_list(out, list);
    }
}

fn method_size(method: &Method) -> usize {
    size_string(&method.name)
        + size_long(method.flags)
        + size_long(method.access)
        + size_long(method.native.unwrap_or(-1))
        + size_long_list(&method.args)
        + size_long(method.rest.unwrap_or(-1))
        + size_long_list(&method.vars)
        + size_long_list(&method.opcodes)
        + size_long(method.error_lists.len() as i64)
        + method
            .error_lists
            .iter()
            .map(|l| size_long_list(l))
            .sum::<usize>()
}

fn decode_method(buf: &mut impl Buf) -> StoreResult<Method> {
    let name = read_string(buf)?;
    let flags = read_long(buf)?;
    let access = read_long(buf)?;
    let native = read_opt_long(buf)?;
    let args = read_long_list(buf)?;
    let rest = read_opt_long(buf)?;
    let vars = read_long_list(buf)?;
    let opcodes = read_long_list(buf)?;
    let list_count = read_len(buf)?;
    let mut error_lists = Vec::with_capacity(list_count);
    for _ in 0..list_count {
        error_lists.push(read_long_list(buf)?);
    }
    Ok(Method {
        name,
        flags,
        access,
        native,
        args,
        rest,
        vars,
        opcodes,
        error_lists,
    })
}
