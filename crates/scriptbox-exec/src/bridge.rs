//! Host/guest value conversion.
//!
//! Both directions are depth-bounded recursive copies. Host values deeper
//! than [`MAX_DEPTH`] never cross, in either direction, so a hostile nest
//! cannot exhaust the native stack through the bridge. Guest storage
//! allocated before a failed conversion stays in the arena until the engine
//! is discarded.

use scriptbox_core::{Error, Value};
use scriptbox_vm::heap::GuestValue;
use scriptbox_vm::{EvalAbort, Interp};

/// Maximum nesting a value may have and still cross the bridge.
pub const MAX_DEPTH: u32 = 32;

pub fn to_guest(interp: &mut Interp, value: &Value) -> Result<GuestValue, Error> {
    guest_rec(interp, value, 0)
}

fn guest_rec(interp: &mut Interp, value: &Value, depth: u32) -> Result<GuestValue, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::TooDeep);
    }
    Ok(match value {
        Value::Nil => GuestValue::Nil,
        Value::Bool(b) => GuestValue::from_bool(*b),
        Value::Integer(i) => GuestValue::Fixnum(*i),
        Value::String(s) => alloc(interp.heap_mut().new_str(s.as_bytes()))?,
        Value::Symbol(s) => GuestValue::Sym(interp.heap_mut().intern(s)),
        Value::Array(items) => {
            let mut converted = Vec::with_capacity(items.len());
            for item in items {
                converted.push(guest_rec(interp, item, depth + 1)?);
            }
            alloc(interp.heap_mut().new_array(&converted))?
        }
        Value::Map(pairs) => {
            let mut converted = Vec::with_capacity(pairs.len());
            for (key, val) in pairs {
                converted.push((
                    guest_rec(interp, key, depth + 1)?,
                    guest_rec(interp, val, depth + 1)?,
                ));
            }
            alloc(interp.heap_mut().new_map(&converted))?
        }
    })
}

pub fn to_host(interp: &Interp, value: GuestValue) -> Result<Value, Error> {
    host_rec(interp, value, 0)
}

fn host_rec(interp: &Interp, value: GuestValue, depth: u32) -> Result<Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::TooDeep);
    }
    let heap = interp.heap();
    Ok(match value {
        GuestValue::Nil => Value::Nil,
        GuestValue::False => Value::Bool(false),
        GuestValue::True => Value::Bool(true),
        GuestValue::Fixnum(i) => Value::Integer(i),
        GuestValue::Sym(s) => Value::Symbol(heap.symbol_name(s).to_string()),
        GuestValue::Str(r) => Value::String(String::from_utf8_lossy(heap.str_bytes(r)).into_owned()),
        GuestValue::Array(r) => {
            let mut items = Vec::with_capacity(heap.array_len(r));
            for i in 0..heap.array_len(r) {
                let item = heap
                    .array_get(r, i)
                    .ok_or_else(|| Error::Internal("array shrank during conversion".to_string()))?;
                items.push(host_rec(interp, item, depth + 1)?);
            }
            Value::Array(items)
        }
        GuestValue::Map(r) => {
            let mut pairs = Vec::with_capacity(heap.map_len(r));
            for i in 0..heap.map_len(r) {
                let (key, val) = heap.map_pair(r, i);
                pairs.push((host_rec(interp, key, depth + 1)?, host_rec(interp, val, depth + 1)?));
            }
            Value::Map(pairs)
        }
    })
}

fn alloc(result: Result<GuestValue, EvalAbort>) -> Result<GuestValue, Error> {
    result.map_err(|abort| match abort {
        EvalAbort::MemoryQuotaReached {
            requested,
            used,
            capacity,
        } => Error::MemoryQuotaReached {
            requested,
            used,
            capacity,
        },
        other => Error::Internal(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_core::config::MIB;
    use scriptbox_mem::Arena;
    use scriptbox_vm::interp_with_arena;

    fn interp() -> Interp {
        interp_with_arena(Arena::new(MIB).unwrap())
    }

    fn nested(depth: u32) -> Value {
        let mut value = Value::Integer(0);
        for _ in 0..depth {
            value = Value::Array(vec![value]);
        }
        value
    }

    #[test]
    fn round_trips_a_mixed_value() {
        let mut vm = interp();
        let original = Value::Map(vec![
            (Value::Symbol("name".into()), Value::String("cart".into())),
            (
                Value::String("items".into()),
                Value::Array(vec![Value::Integer(3), Value::Bool(true), Value::Nil]),
            ),
        ]);
        let guest = to_guest(&mut vm, &original).unwrap();
        assert_eq!(to_host(&vm, guest).unwrap(), original);
    }

    #[test]
    fn depth_limit_is_exact() {
        let mut vm = interp();
        let ok = nested(MAX_DEPTH);
        let guest = to_guest(&mut vm, &ok).unwrap();
        assert_eq!(to_host(&vm, guest).unwrap(), ok);

        let too_deep = nested(MAX_DEPTH + 1);
        assert_eq!(to_guest(&mut vm, &too_deep), Err(Error::TooDeep));
    }

    #[test]
    fn oversized_value_reports_memory_quota() {
        let mut vm = interp_with_arena(Arena::new(256 * 1024).unwrap());
        let big = Value::String("x".repeat(4 * MIB));
        assert!(matches!(
            to_guest(&mut vm, &big),
            Err(Error::MemoryQuotaReached { .. })
        ));
    }
}
