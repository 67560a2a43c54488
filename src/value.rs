//! Values produced by build functions, and their on-disk encoding.

use crate::graph::TargetId;
use anyhow::bail;

/// A value as computed by an `expr:` target's build function or bound to a
/// context symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Integer(i64),
    Real(f64),
    String(String),
    List(Vec<Value>),
    /// Entries in insertion order.
    Map(Vec<(Value, Value)>),
    Target(TargetId),
}

impl Value {
    /// Visit every target referenced anywhere inside this value.
    pub fn for_each_target(&self, f: &mut impl FnMut(TargetId)) {
        match self {
            Value::Target(id) => f(*id),
            Value::List(items) => {
                for item in items {
                    item.for_each_target(f);
                }
            }
            Value::Map(entries) => {
                for (k, v) in entries {
                    k.for_each_target(f);
                    v.for_each_target(f);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Integer(n)
    }
}

impl From<TargetId> for Value {
    fn from(id: TargetId) -> Value {
        Value::Target(id)
    }
}

const TAG_NIL: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_REAL: u8 = 3;
const TAG_LIST: u8 = 4;
const TAG_MAP: u8 = 5;
const TAG_TARGET: u8 = 6;

pub fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Nil => out.push(TAG_NIL),
        Value::String(s) => {
            out.push(TAG_STRING);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Integer(n) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Real(r) => {
            out.push(TAG_REAL);
            out.extend_from_slice(&r.to_bits().to_le_bytes());
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode(item, out);
            }
        }
        Value::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (k, v) in entries {
                encode(k, out);
                encode(v, out);
            }
        }
        Value::Target(id) => {
            out.push(TAG_TARGET);
            out.extend_from_slice(&(id.index() as u32).to_le_bytes());
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() - self.ofs < n {
            bail!("truncated value at offset {}", self.ofs);
        }
        let bytes = &self.buf[self.ofs..self.ofs + n];
        self.ofs += n;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> anyhow::Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&mut self) -> anyhow::Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn read_value(&mut self, target_count: usize) -> anyhow::Result<Value> {
        let tag = self.take(1)?[0];
        Ok(match tag {
            TAG_NIL => Value::Nil,
            TAG_STRING => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                Value::String(String::from_utf8(bytes.to_vec())?)
            }
            TAG_INTEGER => Value::Integer(self.read_u64()? as i64),
            TAG_REAL => Value::Real(f64::from_bits(self.read_u64()?)),
            TAG_LIST => {
                let n = self.read_u32()?;
                let mut items = Vec::new();
                for _ in 0..n {
                    items.push(self.read_value(target_count)?);
                }
                Value::List(items)
            }
            TAG_MAP => {
                let n = self.read_u32()?;
                let mut entries = Vec::new();
                for _ in 0..n {
                    let k = self.read_value(target_count)?;
                    let v = self.read_value(target_count)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            TAG_TARGET => {
                let index = self.read_u32()? as usize;
                if index >= target_count {
                    bail!("value refers to unknown target index {}", index);
                }
                Value::Target(TargetId::from(index))
            }
            _ => bail!("unknown value tag {}", tag),
        })
    }
}

/// Decode a value written by `encode`.  `target_count` bounds the target
/// indices the value may refer to.
pub fn decode(buf: &[u8], target_count: usize) -> anyhow::Result<Value> {
    let mut r = Reader { buf, ofs: 0 };
    let value = r.read_value(target_count)?;
    if r.ofs != buf.len() {
        bail!("{} trailing bytes after value", buf.len() - r.ofs);
    }
    Ok(value)
}
