//! Guest values and the heap that owns their storage.
//!
//! Immediate values (nil, booleans, integers, symbol ids) fit in the
//! [`GuestValue`] word itself. String bytes and array/map element storage
//! live in the engine arena, so every guest allocation counts against the
//! engine's memory quota. The object table and symbol names are small
//! host-side bookkeeping. There is no collector: objects live until the
//! engine is discarded, and element storage is released eagerly when a
//! container regrows.

use std::ptr::NonNull;

use scriptbox_mem::Arena;

use crate::error::EvalAbort;

/// Cap on recursive value comparison, so self-similar nests cannot blow the
/// native stack from inside a `==`.
const MAX_EQ_DEPTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestValue {
    Nil,
    False,
    True,
    Fixnum(i64),
    Str(ObjRef),
    Sym(SymbolId),
    Array(ObjRef),
    Map(ObjRef),
}

impl GuestValue {
    pub fn truthy(self) -> bool {
        !matches!(self, GuestValue::Nil | GuestValue::False)
    }

    pub fn from_bool(b: bool) -> GuestValue {
        if b {
            GuestValue::True
        } else {
            GuestValue::False
        }
    }

    /// Class name used in guest error messages.
    pub fn type_name(self) -> &'static str {
        match self {
            GuestValue::Nil => "NilClass",
            GuestValue::False => "FalseClass",
            GuestValue::True => "TrueClass",
            GuestValue::Fixnum(_) => "Integer",
            GuestValue::Str(_) => "String",
            GuestValue::Sym(_) => "Symbol",
            GuestValue::Array(_) => "Array",
            GuestValue::Map(_) => "Hash",
        }
    }
}

/// Arena image of one value, 16 bytes. Containers store their elements as a
/// run of these.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawValue {
    tag: u64,
    bits: u64,
}

const RAW_SIZE: usize = std::mem::size_of::<RawValue>();

const TAG_NIL: u64 = 0;
const TAG_FALSE: u64 = 1;
const TAG_TRUE: u64 = 2;
const TAG_FIXNUM: u64 = 3;
const TAG_STR: u64 = 4;
const TAG_SYM: u64 = 5;
const TAG_ARRAY: u64 = 6;
const TAG_MAP: u64 = 7;

fn encode_raw(v: GuestValue) -> RawValue {
    match v {
        GuestValue::Nil => RawValue { tag: TAG_NIL, bits: 0 },
        GuestValue::False => RawValue { tag: TAG_FALSE, bits: 0 },
        GuestValue::True => RawValue { tag: TAG_TRUE, bits: 0 },
        GuestValue::Fixnum(i) => RawValue { tag: TAG_FIXNUM, bits: i as u64 },
        GuestValue::Str(r) => RawValue { tag: TAG_STR, bits: r.0 as u64 },
        GuestValue::Sym(s) => RawValue { tag: TAG_SYM, bits: s.0 as u64 },
        GuestValue::Array(r) => RawValue { tag: TAG_ARRAY, bits: r.0 as u64 },
        GuestValue::Map(r) => RawValue { tag: TAG_MAP, bits: r.0 as u64 },
    }
}

fn decode_raw(raw: RawValue) -> GuestValue {
    match raw.tag {
        TAG_NIL => GuestValue::Nil,
        TAG_FALSE => GuestValue::False,
        TAG_TRUE => GuestValue::True,
        TAG_FIXNUM => GuestValue::Fixnum(raw.bits as i64),
        TAG_STR => GuestValue::Str(ObjRef(raw.bits as u32)),
        TAG_SYM => GuestValue::Sym(SymbolId(raw.bits as u32)),
        TAG_ARRAY => GuestValue::Array(ObjRef(raw.bits as u32)),
        TAG_MAP => GuestValue::Map(ObjRef(raw.bits as u32)),
        _ => {
            debug_assert!(false, "corrupt value tag {}", raw.tag);
            GuestValue::Nil
        }
    }
}

enum Obj {
    Str {
        ptr: Option<NonNull<u8>>,
        len: usize,
    },
    Array {
        ptr: Option<NonNull<u8>>,
        len: usize,
        cap: usize,
    },
    Map {
        ptr: Option<NonNull<u8>>,
        /// Pair count.
        len: usize,
        cap: usize,
    },
}

pub struct GuestHeap {
    arena: Arena,
    objects: Vec<Obj>,
    symbols: Vec<String>,
}

// The heap is confined to one thread at a time; monitored evaluation moves
// the borrow to the worker for the duration of a call. Every raw pointer
// targets the heap's own arena mapping.
unsafe impl Send for GuestHeap {}

impl GuestHeap {
    pub fn new(arena: Arena) -> GuestHeap {
        GuestHeap {
            arena,
            objects: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, EvalAbort> {
        self.arena.allocate(size).ok_or(EvalAbort::MemoryQuotaReached {
            requested: size,
            used: self.arena.allocation(),
            capacity: self.arena.capacity(),
        })
    }

    fn push_obj(&mut self, obj: Obj) -> ObjRef {
        self.objects.push(obj);
        ObjRef(self.objects.len() as u32 - 1)
    }

    fn obj(&self, r: ObjRef) -> &Obj {
        &self.objects[r.0 as usize]
    }

    // ---- symbols ----

    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(i) = self.symbols.iter().position(|s| s == name) {
            return SymbolId(i as u32);
        }
        self.symbols.push(name.to_string());
        SymbolId(self.symbols.len() as u32 - 1)
    }

    pub fn symbol_name(&self, id: SymbolId) -> &str {
        &self.symbols[id.0 as usize]
    }

    // ---- strings ----

    pub fn new_str(&mut self, bytes: &[u8]) -> Result<GuestValue, EvalAbort> {
        let ptr = if bytes.is_empty() {
            None
        } else {
            let ptr = self.alloc(bytes.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            }
            Some(ptr)
        };
        let r = self.push_obj(Obj::Str {
            ptr,
            len: bytes.len(),
        });
        Ok(GuestValue::Str(r))
    }

    pub fn str_bytes(&self, r: ObjRef) -> &[u8] {
        match self.obj(r) {
            Obj::Str { ptr: Some(p), len } => unsafe {
                std::slice::from_raw_parts(p.as_ptr(), *len)
            },
            Obj::Str { ptr: None, .. } => &[],
            _ => panic!("not a string"),
        }
    }

    pub fn str_concat(&mut self, a: ObjRef, b: ObjRef) -> Result<GuestValue, EvalAbort> {
        let mut bytes = Vec::with_capacity(self.str_bytes(a).len() + self.str_bytes(b).len());
        bytes.extend_from_slice(self.str_bytes(a));
        bytes.extend_from_slice(self.str_bytes(b));
        self.new_str(&bytes)
    }

    pub fn str_repeat(&mut self, s: ObjRef, count: usize) -> Result<GuestValue, EvalAbort> {
        let (src, len) = match self.obj(s) {
            Obj::Str { ptr, len } => (*ptr, *len),
            _ => panic!("not a string"),
        };
        let total = len.checked_mul(count).ok_or(EvalAbort::MemoryQuotaReached {
            requested: usize::MAX,
            used: self.arena.allocation(),
            capacity: self.arena.capacity(),
        })?;
        if total == 0 {
            return self.new_str(&[]);
        }
        // Arena block first, then fill. The quota binds before any host
        // allocation can happen.
        let ptr = self.alloc(total)?;
        let src = src.unwrap().as_ptr();
        for i in 0..count {
            unsafe {
                std::ptr::copy_nonoverlapping(src, ptr.as_ptr().add(i * len), len);
            }
        }
        let r = self.push_obj(Obj::Str {
            ptr: Some(ptr),
            len: total,
        });
        Ok(GuestValue::Str(r))
    }

    // ---- arrays ----

    pub fn new_array(&mut self, items: &[GuestValue]) -> Result<GuestValue, EvalAbort> {
        let cap = items.len();
        let ptr = if cap == 0 {
            None
        } else {
            let ptr = self.alloc(cap * RAW_SIZE)?;
            let base = ptr.as_ptr() as *mut RawValue;
            for (i, &item) in items.iter().enumerate() {
                unsafe { base.add(i).write(encode_raw(item)) };
            }
            Some(ptr)
        };
        let r = self.push_obj(Obj::Array {
            ptr,
            len: cap,
            cap,
        });
        Ok(GuestValue::Array(r))
    }

    pub fn array_len(&self, r: ObjRef) -> usize {
        match self.obj(r) {
            Obj::Array { len, .. } => *len,
            _ => panic!("not an array"),
        }
    }

    pub fn array_get(&self, r: ObjRef, index: usize) -> Option<GuestValue> {
        match self.obj(r) {
            Obj::Array { ptr, len, .. } => {
                if index >= *len {
                    return None;
                }
                let base = ptr.unwrap().as_ptr() as *const RawValue;
                Some(decode_raw(unsafe { base.add(index).read() }))
            }
            _ => panic!("not an array"),
        }
    }

    pub fn array_push(&mut self, r: ObjRef, value: GuestValue) -> Result<(), EvalAbort> {
        let (old_ptr, len, cap) = match self.obj(r) {
            Obj::Array { ptr, len, cap } => (*ptr, *len, *cap),
            _ => panic!("not an array"),
        };
        let ptr = if len == cap {
            let new_cap = (cap * 2).max(4);
            let new_ptr = match old_ptr {
                Some(p) => self
                    .arena
                    .reallocate(p, new_cap * RAW_SIZE)
                    .ok_or(EvalAbort::MemoryQuotaReached {
                        requested: new_cap * RAW_SIZE,
                        used: self.arena.allocation(),
                        capacity: self.arena.capacity(),
                    })?,
                None => self.alloc(new_cap * RAW_SIZE)?,
            };
            match &mut self.objects[r.0 as usize] {
                Obj::Array { ptr, cap, .. } => {
                    *ptr = Some(new_ptr);
                    *cap = new_cap;
                }
                _ => unreachable!(),
            }
            new_ptr
        } else {
            old_ptr.unwrap()
        };
        unsafe {
            (ptr.as_ptr() as *mut RawValue).add(len).write(encode_raw(value));
        }
        match &mut self.objects[r.0 as usize] {
            Obj::Array { len, .. } => *len += 1,
            _ => unreachable!(),
        }
        Ok(())
    }

    // ---- maps ----

    /// Build a map from key/value pairs in order. A repeated key overwrites
    /// the earlier entry in place, keeping the first insertion position.
    pub fn new_map(&mut self, pairs: &[(GuestValue, GuestValue)]) -> Result<GuestValue, EvalAbort> {
        let r = self.push_obj(Obj::Map {
            ptr: None,
            len: 0,
            cap: 0,
        });
        for &(key, value) in pairs {
            self.map_insert(r, key, value)?;
        }
        Ok(GuestValue::Map(r))
    }

    pub fn map_len(&self, r: ObjRef) -> usize {
        match self.obj(r) {
            Obj::Map { len, .. } => *len,
            _ => panic!("not a map"),
        }
    }

    pub fn map_pair(&self, r: ObjRef, index: usize) -> (GuestValue, GuestValue) {
        match self.obj(r) {
            Obj::Map { ptr, len, .. } => {
                assert!(index < *len);
                let base = ptr.unwrap().as_ptr() as *const RawValue;
                unsafe {
                    (
                        decode_raw(base.add(index * 2).read()),
                        decode_raw(base.add(index * 2 + 1).read()),
                    )
                }
            }
            _ => panic!("not a map"),
        }
    }

    pub fn map_get(&self, r: ObjRef, key: GuestValue) -> Result<Option<GuestValue>, EvalAbort> {
        for i in 0..self.map_len(r) {
            let (k, v) = self.map_pair(r, i);
            if self.deep_eq(k, key, 0)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    pub fn map_insert(
        &mut self,
        r: ObjRef,
        key: GuestValue,
        value: GuestValue,
    ) -> Result<(), EvalAbort> {
        for i in 0..self.map_len(r) {
            let (k, _) = self.map_pair(r, i);
            if self.deep_eq(k, key, 0)? {
                match self.obj(r) {
                    Obj::Map { ptr, .. } => unsafe {
                        (ptr.unwrap().as_ptr() as *mut RawValue)
                            .add(i * 2 + 1)
                            .write(encode_raw(value));
                    },
                    _ => unreachable!(),
                }
                return Ok(());
            }
        }
        let (old_ptr, len, cap) = match self.obj(r) {
            Obj::Map { ptr, len, cap } => (*ptr, *len, *cap),
            _ => panic!("not a map"),
        };
        let ptr = if len == cap {
            let new_cap = (cap * 2).max(4);
            let new_ptr = match old_ptr {
                Some(p) => self
                    .arena
                    .reallocate(p, new_cap * 2 * RAW_SIZE)
                    .ok_or(EvalAbort::MemoryQuotaReached {
                        requested: new_cap * 2 * RAW_SIZE,
                        used: self.arena.allocation(),
                        capacity: self.arena.capacity(),
                    })?,
                None => self.alloc(new_cap * 2 * RAW_SIZE)?,
            };
            match &mut self.objects[r.0 as usize] {
                Obj::Map { ptr, cap, .. } => {
                    *ptr = Some(new_ptr);
                    *cap = new_cap;
                }
                _ => unreachable!(),
            }
            new_ptr
        } else {
            old_ptr.unwrap()
        };
        unsafe {
            let base = ptr.as_ptr() as *mut RawValue;
            base.add(len * 2).write(encode_raw(key));
            base.add(len * 2 + 1).write(encode_raw(value));
        }
        match &mut self.objects[r.0 as usize] {
            Obj::Map { len, .. } => *len += 1,
            _ => unreachable!(),
        }
        Ok(())
    }

    // ---- equality ----

    /// Structural equality. References to the same object short-circuit, and
    /// recursion is depth-bounded.
    pub fn deep_eq(&self, a: GuestValue, b: GuestValue, depth: u32) -> Result<bool, EvalAbort> {
        if depth > MAX_EQ_DEPTH {
            return Err(EvalAbort::Internal(
                "value comparison recursed too deeply".to_string(),
            ));
        }
        Ok(match (a, b) {
            (GuestValue::Str(x), GuestValue::Str(y)) => {
                x == y || self.str_bytes(x) == self.str_bytes(y)
            }
            (GuestValue::Array(x), GuestValue::Array(y)) => {
                if x == y {
                    return Ok(true);
                }
                if self.array_len(x) != self.array_len(y) {
                    return Ok(false);
                }
                for i in 0..self.array_len(x) {
                    let ax = self.array_get(x, i).unwrap();
                    let ay = self.array_get(y, i).unwrap();
                    if !self.deep_eq(ax, ay, depth + 1)? {
                        return Ok(false);
                    }
                }
                true
            }
            (GuestValue::Map(x), GuestValue::Map(y)) => {
                if x == y {
                    return Ok(true);
                }
                if self.map_len(x) != self.map_len(y) {
                    return Ok(false);
                }
                for i in 0..self.map_len(x) {
                    let (k, v) = self.map_pair(x, i);
                    match self.map_get_at_depth(y, k, depth + 1)? {
                        Some(other) if self.deep_eq(v, other, depth + 1)? => {}
                        _ => return Ok(false),
                    }
                }
                true
            }
            _ => a == b,
        })
    }

    fn map_get_at_depth(
        &self,
        r: ObjRef,
        key: GuestValue,
        depth: u32,
    ) -> Result<Option<GuestValue>, EvalAbort> {
        for i in 0..self.map_len(r) {
            let (k, v) = self.map_pair(r, i);
            if self.deep_eq(k, key, depth)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_core::config::KIB;

    fn heap() -> GuestHeap {
        GuestHeap::new(Arena::new(512 * KIB).unwrap())
    }

    #[test]
    fn strings_round_trip_through_the_arena() {
        let mut h = heap();
        let s = h.new_str(b"hello world").unwrap();
        let r = match s {
            GuestValue::Str(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(h.str_bytes(r), b"hello world");
        assert!(h.arena().allocation() > 0);
    }

    #[test]
    fn str_repeat_fails_the_quota_without_touching_host_memory() {
        let mut h = heap();
        let s = match h.new_str(b"xx").unwrap() {
            GuestValue::Str(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        // Overflows usize when multiplied by the length.
        let err = h.str_repeat(s, usize::MAX).unwrap_err();
        assert!(matches!(err, EvalAbort::MemoryQuotaReached { .. }));
        // Fits in usize but not in the arena.
        let err = h.str_repeat(s, usize::MAX / 4).unwrap_err();
        assert!(matches!(err, EvalAbort::MemoryQuotaReached { .. }));
        // The heap still works afterwards.
        let ok = h.str_repeat(s, 3).unwrap();
        let r = match ok {
            GuestValue::Str(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(h.str_bytes(r), b"xxxxxx");
    }

    #[test]
    fn symbols_intern_once() {
        let mut h = heap();
        let a = h.intern("checkout");
        let b = h.intern("checkout");
        let c = h.intern("cart");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(h.symbol_name(c), "cart");
    }

    #[test]
    fn arrays_grow_and_index() {
        let mut h = heap();
        let arr = match h.new_array(&[]).unwrap() {
            GuestValue::Array(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        for i in 0..100 {
            h.array_push(arr, GuestValue::Fixnum(i)).unwrap();
        }
        assert_eq!(h.array_len(arr), 100);
        assert_eq!(h.array_get(arr, 42), Some(GuestValue::Fixnum(42)));
        assert_eq!(h.array_get(arr, 100), None);
    }

    #[test]
    fn maps_keep_insertion_order_and_overwrite_in_place() {
        let mut h = heap();
        let k1 = h.new_str(b"a").unwrap();
        let k1_dup = h.new_str(b"a").unwrap();
        let k2 = h.new_str(b"b").unwrap();
        let m = match h
            .new_map(&[
                (k1, GuestValue::Fixnum(1)),
                (k2, GuestValue::Fixnum(2)),
                (k1_dup, GuestValue::Fixnum(3)),
            ])
            .unwrap()
        {
            GuestValue::Map(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(h.map_len(m), 2);
        // Overwritten key keeps its first position.
        let (first_key, first_value) = h.map_pair(m, 0);
        assert!(h.deep_eq(first_key, k1, 0).unwrap());
        assert_eq!(first_value, GuestValue::Fixnum(3));
        assert_eq!(h.map_get(m, k1_dup).unwrap(), Some(GuestValue::Fixnum(3)));
    }

    #[test]
    fn deep_eq_compares_structure() {
        let mut h = heap();
        let a = h.new_array(&[GuestValue::Fixnum(1), GuestValue::Nil]).unwrap();
        let b = h.new_array(&[GuestValue::Fixnum(1), GuestValue::Nil]).unwrap();
        let c = h.new_array(&[GuestValue::Fixnum(2), GuestValue::Nil]).unwrap();
        assert!(h.deep_eq(a, b, 0).unwrap());
        assert!(!h.deep_eq(a, c, 0).unwrap());
        assert!(!h.deep_eq(a, GuestValue::Nil, 0).unwrap());
    }

    #[test]
    fn allocation_failure_reports_quota() {
        let mut h = GuestHeap::new(Arena::new(256 * KIB).unwrap());
        let err = h.new_str(&vec![0u8; 4 * 1024 * 1024]).unwrap_err();
        assert!(matches!(err, EvalAbort::MemoryQuotaReached { .. }));
    }
}
