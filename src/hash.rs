//! Content hashes.  Every target reduces its state to a 256-bit `Hash`; a
//! target is considered updated in an iteration when its hash differs from
//! the one recorded in the db.

use crate::intern::Intern;
use crate::value::Value;
use sha2::{Digest, Sha256};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn filled(byte: u8) -> Hash {
        Hash([byte; 32])
    }

    pub fn of(bytes: &[u8]) -> Hash {
        Hash(Sha256::digest(bytes).into())
    }

    /// A hash that encodes a small number in its leading bytes.
    pub fn from_u32(n: u32) -> Hash {
        let mut h = Hash::ZERO;
        h.0[..4].copy_from_slice(&n.to_le_bytes());
        h
    }

    pub fn xor(&mut self, other: &Hash) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    /// XOR `bytes` into the hash, wrapping around every 32 bytes.
    pub fn xor_cyclic(&mut self, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.0[i % 32] ^= b;
        }
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// Structural hash of a value.  Target references hash by their id string,
/// which is why the intern table is needed.
pub fn value_hash(value: &Value, ids: &Intern) -> Hash {
    match value {
        Value::Nil => Hash::filled(0xFF),
        Value::Integer(n) => {
            let mut h = Hash::ZERO;
            h.0[..8].copy_from_slice(&n.to_le_bytes());
            h.0[31] = 1;
            h
        }
        Value::Real(r) => {
            let mut h = Hash::ZERO;
            h.0[..8].copy_from_slice(&r.to_bits().to_le_bytes());
            h.0[31] = 2;
            h
        }
        Value::String(s) => Hash::of(s.as_bytes()),
        Value::List(items) => {
            let mut ctx = Sha256::new();
            for item in items {
                ctx.update(value_hash(item, ids).0);
            }
            Hash(ctx.finalize().into())
        }
        Value::Map(entries) => {
            let mut ctx = Sha256::new();
            for (k, v) in entries {
                ctx.update(value_hash(k, ids).0);
                ctx.update(value_hash(v, ids).0);
            }
            Hash(ctx.finalize().into())
        }
        Value::Target(id) => Hash::of(ids.get(*id).as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars() {
        let ids = Intern::new();
        assert_eq!(value_hash(&Value::Nil, &ids), Hash::filled(0xFF));
        let one = value_hash(&Value::Integer(1), &ids);
        assert_eq!(one.0[0], 1);
        assert_eq!(one.0[31], 1);
        assert_ne!(one, value_hash(&Value::Real(1.0), &ids));
        assert_eq!(
            value_hash(&Value::String("abc".into()), &ids),
            Hash::of(b"abc")
        );
    }

    #[test]
    fn structure_is_ordered() {
        let ids = Intern::new();
        let ab = Value::List(vec![Value::Integer(1), Value::Integer(2)]);
        let ba = Value::List(vec![Value::Integer(2), Value::Integer(1)]);
        assert_ne!(value_hash(&ab, &ids), value_hash(&ba, &ids));
        assert_eq!(value_hash(&ab, &ids), value_hash(&ab.clone(), &ids));
    }

    #[test]
    fn target_hashes_by_id() {
        let mut ids = Intern::new();
        let (t, _) = ids.add("file:x.h");
        assert_eq!(value_hash(&Value::Target(t), &ids), Hash::of(b"file:x.h"));
    }

    #[test]
    fn xor_cyclic_wraps() {
        let mut h = Hash::ZERO;
        h.xor_cyclic(&[1; 33]);
        assert_eq!(h.0[0], 0);
        assert_eq!(h.0[1], 1);
        let mut g = h;
        g.xor(&h);
        assert_eq!(g, Hash::ZERO);
    }
}
