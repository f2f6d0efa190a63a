//! Memory objects and their byte stores.
//!
//! A [`MemoryObject`] is an immutable descriptor of one allocation; the
//! mutable bytes live in an [`ObjectState`]. Pointers carry the object's
//! `segment` as provenance, so every store keeps two planes: the offset
//! plane holds the data bytes, the segment plane holds the provenance bytes
//! of pointers stored into the object.

use crate::expr::{Array, Expr, UpdateList, Value, Width, PTR_WIDTH};
use crate::ir::{CodePtr, Type};
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Segment of plain scalars.
pub const SCALAR_SEGMENT: u64 = 0;
/// Reserved segment naming functions; function pointers live here.
pub const FUNCTIONS_SEGMENT: u64 = 1;
/// Reserved segment for the errno mirror object.
pub const ERRNO_SEGMENT: u64 = 2;
/// First segment handed out for ordinary allocations.
pub const FIRST_ORDINARY_SEGMENT: u64 = 3;

#[derive(Debug, Clone)]
pub struct AllocSite {
    pub description: String,
    pub code: Option<CodePtr>,
    pub ty: Option<Type>,
}

impl AllocSite {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            code: None,
            ty: None,
        }
    }

    pub fn at(description: impl Into<String>, code: CodePtr) -> Self {
        Self {
            description: description.into(),
            code: Some(code),
            ty: None,
        }
    }

    pub fn with_type(mut self, ty: Type) -> Self {
        self.ty = Some(ty);
        self
    }
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} at {}", self.description, code),
            None => write!(f, "{}", self.description),
        }
    }
}

/// Immutable descriptor of one allocation, shared by reference counting.
#[derive(Debug)]
pub struct MemoryObject {
    pub id: u64,
    pub segment: u64,
    pub size: Expr,
    pub allocated_size: u64,
    pub is_local: bool,
    pub is_global: bool,
    pub is_fixed: bool,
    pub is_user_specified: bool,
    pub alloc_site: AllocSite,
    pub alignment: u64,
    /// Pinned host address of fixed objects.
    pub address: Option<u64>,
}

impl MemoryObject {
    pub fn pointer(&self) -> Value {
        Value::pointer(self.segment, Expr::zero(PTR_WIDTH))
    }

    pub fn segment_expr(&self) -> Expr {
        Expr::pointer(self.segment)
    }

    pub fn concrete_size(&self) -> Option<u64> {
        self.size.as_u64()
    }

    pub fn is_heap(&self) -> bool {
        !self.is_local && !self.is_global && !self.is_fixed
    }

    /// True iff an access of `bytes` bytes at `offset` stays in bounds.
    pub fn bounds_check_offset(&self, offset: &Expr, bytes: u64) -> Expr {
        assert!(bytes >= 1);
        let fits = Expr::ule(Expr::pointer(bytes), self.size.clone());
        let upper = Expr::sub(self.size.clone(), Expr::pointer(bytes - 1));
        Expr::and_bool(fits, Expr::ult(offset.clone(), upper))
    }

    /// Segment match plus offset bounds, the full pointer check.
    pub fn bounds_check_pointer(&self, pointer: &Value, bytes: u64) -> Expr {
        Expr::and_bool(
            Expr::eq(self.segment_expr(), pointer.segment.clone()),
            self.bounds_check_offset(&pointer.offset, bytes),
        )
    }
}

/// One byte plane: concrete store, symbolic per-byte overlay, and (once a
/// symbolic index touched the plane) an array-theory update list.
#[derive(Debug, Clone)]
struct ObjectPlane {
    label: String,
    concrete: Vec<u8>,
    known_symbolics: Vec<Option<Expr>>,
    updates: Option<UpdateList>,
}

impl ObjectPlane {
    fn new(label: String, size: usize) -> Self {
        Self {
            label,
            concrete: vec![0; size],
            known_symbolics: vec![None; size],
            updates: None,
        }
    }

    fn backed_by(label: String, size: usize, array: Rc<Array>) -> Self {
        Self {
            label,
            concrete: vec![0; size],
            known_symbolics: vec![None; size],
            updates: Some(UpdateList::new(array)),
        }
    }

    /// Fold the concrete content and the symbolic overlay into an update
    /// list so symbolic indexes can address the plane.
    fn flush(&mut self) {
        if self.updates.is_some() {
            return;
        }
        let array = Array::concrete(self.label.clone(), self.concrete.clone());
        let mut updates = UpdateList::new(array);
        for (index, slot) in self.known_symbolics.iter().enumerate() {
            if let Some(expr) = slot {
                updates = updates.extend(Expr::pointer(index as u64), expr.clone());
            }
        }
        self.updates = Some(updates);
    }

    fn read8(&mut self, index: &Expr) -> Expr {
        if self.updates.is_none() {
            if let Some(i) = index.as_u64() {
                let i = i as usize;
                assert!(i < self.concrete.len(), "plane read out of bounds");
                return match &self.known_symbolics[i] {
                    Some(expr) => expr.clone(),
                    None => Expr::constant(8, self.concrete[i] as u128),
                };
            }
            self.flush();
        }
        Expr::read(self.updates.as_ref().unwrap(), index.clone())
    }

    fn write8(&mut self, index: &Expr, byte: Expr) {
        if self.updates.is_none() {
            if let Some(i) = index.as_u64() {
                let i = i as usize;
                assert!(i < self.concrete.len(), "plane write out of bounds");
                match byte.as_constant() {
                    Some(bits) => {
                        self.concrete[i] = bits as u8;
                        self.known_symbolics[i] = None;
                    }
                    None => self.known_symbolics[i] = Some(byte),
                }
                return;
            }
            self.flush();
        }
        let updates = self.updates.as_mut().unwrap();
        *updates = updates.extend(index.clone(), byte);
    }

    fn is_fully_concrete(&self) -> bool {
        self.updates.is_none() && self.known_symbolics.iter().all(Option::is_none)
    }
}

/// Mutable byte store of one [`MemoryObject`], shared copy-on-write across
/// sibling states.
#[derive(Debug, Clone)]
pub struct ObjectState {
    pub copy_on_write_owner: u32,
    pub read_only: bool,
    size_bound: usize,
    offset_plane: ObjectPlane,
    segment_plane: ObjectPlane,
}

impl ObjectState {
    pub fn new(object: &MemoryObject) -> Self {
        let size = object.allocated_size as usize;
        Self {
            copy_on_write_owner: 0,
            read_only: false,
            size_bound: size,
            offset_plane: ObjectPlane::new(format!("mo{}:off", object.id), size),
            segment_plane: ObjectPlane::new(format!("mo{}:seg", object.id), size),
        }
    }

    /// A store whose data bytes are drawn from `array` by the solver.
    pub fn symbolic(object: &MemoryObject, array: Rc<Array>) -> Self {
        let size = object.allocated_size as usize;
        Self {
            copy_on_write_owner: 0,
            read_only: false,
            size_bound: size,
            offset_plane: ObjectPlane::backed_by(format!("mo{}:off", object.id), size, array),
            segment_plane: ObjectPlane::new(format!("mo{}:seg", object.id), size),
        }
    }

    /// Carry the old content over into a store for `object`, as realloc
    /// does. Extra bytes are zero.
    pub fn resized_from(old: &ObjectState, object: &MemoryObject) -> Self {
        let mut new = ObjectState::new(object);
        new.read_only = old.read_only;
        let copy = old.size_bound.min(new.size_bound);
        if old.offset_plane.updates.is_none() && old.segment_plane.updates.is_none() {
            new.offset_plane.concrete[..copy].copy_from_slice(&old.offset_plane.concrete[..copy]);
            new.offset_plane.known_symbolics[..copy]
                .clone_from_slice(&old.offset_plane.known_symbolics[..copy]);
            new.segment_plane.concrete[..copy]
                .copy_from_slice(&old.segment_plane.concrete[..copy]);
            new.segment_plane.known_symbolics[..copy]
                .clone_from_slice(&old.segment_plane.known_symbolics[..copy]);
        } else {
            let mut old = old.clone();
            for i in 0..copy as u64 {
                let index = Expr::pointer(i);
                new.offset_plane
                    .write8(&index, old.offset_plane.read8(&index));
                new.segment_plane
                    .write8(&index, old.segment_plane.read8(&index));
            }
        }
        new
    }

    pub fn size_bound(&self) -> usize {
        self.size_bound
    }

    pub fn initialize_to_zero(&mut self) {
        self.offset_plane.concrete.iter_mut().for_each(|b| *b = 0);
        self.offset_plane.known_symbolics.iter_mut().for_each(|s| *s = None);
    }

    pub fn initialize_to_random(&mut self, rng: &mut impl Rng) {
        for byte in self.offset_plane.concrete.iter_mut() {
            *byte = rng.gen();
        }
        self.offset_plane.known_symbolics.iter_mut().for_each(|s| *s = None);
    }

    /// Read `width` bits at `offset`, little endian. The caller has proved
    /// the access in bounds.
    pub fn read(&mut self, offset: &Expr, width: Width) -> Value {
        let bytes = (width + 7) / 8;
        let mut data = self.offset_plane.read8(offset);
        for i in 1..bytes {
            let index = Expr::add(offset.clone(), Expr::pointer(i as u64));
            data = Expr::concat(self.offset_plane.read8(&index), data);
        }
        if width % 8 != 0 {
            data = Expr::extract(data, 0, width);
        }

        // provenance is only meaningful on the first eight bytes
        let seg_bytes = bytes.min(8);
        let mut segment = self.segment_plane.read8(offset);
        for i in 1..seg_bytes {
            let index = Expr::add(offset.clone(), Expr::pointer(i as u64));
            segment = Expr::concat(self.segment_plane.read8(&index), segment);
        }
        let segment = Expr::zext(segment, PTR_WIDTH);

        Value {
            segment,
            offset: data,
        }
    }

    /// Write `value` at `offset`, little endian, both planes.
    pub fn write(&mut self, offset: &Expr, value: &Value) {
        let width = value.width();
        let bytes = (width + 7) / 8;
        let data = if width % 8 != 0 {
            Expr::zext(value.offset.clone(), bytes * 8)
        } else {
            value.offset.clone()
        };
        for i in 0..bytes {
            let index = if i == 0 {
                offset.clone()
            } else {
                Expr::add(offset.clone(), Expr::pointer(i as u64))
            };
            self.offset_plane
                .write8(&index, Expr::extract(data.clone(), i * 8, 8));
            let seg_byte = if i < 8 {
                Expr::extract(value.segment.clone(), i * 8, 8)
            } else {
                Expr::zero(8)
            };
            self.segment_plane.write8(&index, seg_byte);
        }
    }

    pub fn write_concrete_bytes(&mut self, offset: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let index = Expr::pointer(offset + i as u64);
            self.offset_plane
                .write8(&index, Expr::constant(8, *byte as u128));
            self.segment_plane.write8(&index, Expr::zero(8));
        }
    }

    /// The concrete data bytes, used to pass memory to external calls.
    pub fn concrete_store(&self) -> &[u8] {
        &self.offset_plane.concrete
    }

    pub fn is_fully_concrete(&self) -> bool {
        self.offset_plane.is_fully_concrete() && self.segment_plane.is_fully_concrete()
    }
}

/// Allocator of segments and object descriptors.
#[derive(Debug)]
pub struct MemoryManager {
    next_id: u64,
    next_segment: u64,
    segment_limit: u64,
    freed: HashSet<u64>,
}

impl MemoryManager {
    pub fn new(pointer_width: Width) -> Self {
        // a narrow pointer target gets a narrow segment range
        let segment_limit = if pointer_width == 32 {
            u64::from(u32::MAX)
        } else {
            u64::MAX
        };
        Self {
            next_id: 0,
            next_segment: FIRST_ORDINARY_SEGMENT,
            segment_limit,
            freed: HashSet::new(),
        }
    }

    pub fn allocate(
        &mut self,
        size: Expr,
        allocated_size: u64,
        is_local: bool,
        is_global: bool,
        alloc_site: AllocSite,
        alignment: u64,
    ) -> Option<Rc<MemoryObject>> {
        if self.next_segment >= self.segment_limit {
            return None;
        }
        let segment = self.next_segment;
        self.next_segment += 1;
        let id = self.next_id;
        self.next_id += 1;
        Some(Rc::new(MemoryObject {
            id,
            segment,
            size,
            allocated_size,
            is_local,
            is_global,
            is_fixed: false,
            is_user_specified: false,
            alloc_site,
            alignment: alignment.max(1),
            address: None,
        }))
    }

    /// An externally-managed region pinned at `address`, such as errno.
    pub fn allocate_fixed(
        &mut self,
        address: u64,
        size: u64,
        alloc_site: AllocSite,
        special_segment: Option<u64>,
        is_user_specified: bool,
    ) -> Rc<MemoryObject> {
        let segment = match special_segment {
            Some(segment) => segment,
            None => {
                let segment = self.next_segment;
                self.next_segment += 1;
                segment
            }
        };
        let id = self.next_id;
        self.next_id += 1;
        Rc::new(MemoryObject {
            id,
            segment,
            size: Expr::pointer(size),
            allocated_size: size,
            is_local: false,
            is_global: false,
            is_fixed: true,
            is_user_specified,
            alloc_site,
            alignment: 8,
            address: Some(address),
        })
    }

    /// Highest segment id this manager will hand out.
    pub fn segment_limit(&self) -> u64 {
        self.segment_limit
    }

    pub fn mark_freed(&mut self, segment: u64) {
        self.freed.insert(segment);
    }

    pub fn was_freed(&self, segment: u64) -> bool {
        self.freed.contains(&segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BOOL_WIDTH;

    fn test_object(manager: &mut MemoryManager, size: u64) -> Rc<MemoryObject> {
        manager
            .allocate(
                Expr::pointer(size),
                size,
                false,
                false,
                AllocSite::new("test"),
                8,
            )
            .unwrap()
    }

    #[test]
    fn concrete_write_read_roundtrip() {
        let mut manager = MemoryManager::new(64);
        let mo = test_object(&mut manager, 16);
        let mut os = ObjectState::new(&mo);

        os.write(&Expr::pointer(4), &Value::constant(32, 0xdead_beef));
        let value = os.read(&Expr::pointer(4), 32);
        assert_eq!(value.offset.as_constant(), Some(0xdead_beef));
        assert!(value.has_zero_segment());
        assert!(os.is_fully_concrete());
    }

    #[test]
    fn pointer_write_preserves_provenance() {
        let mut manager = MemoryManager::new(64);
        let mo = test_object(&mut manager, 16);
        let mut os = ObjectState::new(&mo);

        let ptr = Value::pointer(17, Expr::pointer(8));
        os.write(&Expr::pointer(0), &ptr);
        let back = os.read(&Expr::pointer(0), PTR_WIDTH);
        assert_eq!(back.constant_segment(), Some(17));
        assert_eq!(back.offset.as_u64(), Some(8));
    }

    #[test]
    fn symbolic_overlay_survives_concrete_neighbours() {
        let mut manager = MemoryManager::new(64);
        let mo = test_object(&mut manager, 8);
        let mut os = ObjectState::new(&mo);

        let array = Array::symbolic("x", 1);
        let sym = Expr::read(&UpdateList::new(array), Expr::pointer(0));
        os.write(&Expr::pointer(1), &Value::scalar(sym.clone()));
        os.write(&Expr::pointer(0), &Value::constant(8, 3));

        assert!(!os.is_fully_concrete());
        let value = os.read(&Expr::pointer(1), 8);
        assert_eq!(value.offset, sym);
    }

    #[test]
    fn symbolic_index_flushes_to_updates() {
        let mut manager = MemoryManager::new(64);
        let mo = test_object(&mut manager, 4);
        let mut os = ObjectState::new(&mo);
        os.write_concrete_bytes(0, &[1, 2, 3, 4]);

        let array = Array::symbolic("i", 8);
        let index = Expr::read_le(&UpdateList::new(array), &Expr::pointer(0), 8);
        let value = os.read(&index, 8);
        assert!(!value.offset.is_constant());

        // constant reads still see the flushed content
        let third = os.read(&Expr::pointer(2), 8);
        assert_eq!(third.offset.as_constant(), Some(3));
    }

    #[test]
    fn bounds_check_folds_for_concrete_access() {
        let mut manager = MemoryManager::new(64);
        let mo = test_object(&mut manager, 8);

        let ok = mo.bounds_check_offset(&Expr::pointer(4), 4);
        assert_eq!(ok.width(), BOOL_WIDTH);
        assert!(ok.is_true());

        let bad = mo.bounds_check_offset(&Expr::pointer(5), 4);
        assert!(bad.is_false());
    }

    #[test]
    fn segments_are_disjoint() {
        let mut manager = MemoryManager::new(64);
        let a = test_object(&mut manager, 8);
        let b = test_object(&mut manager, 8);
        assert_ne!(a.segment, b.segment);
        assert!(a.segment >= FIRST_ORDINARY_SEGMENT);
    }

    #[test]
    fn narrow_pointer_target_narrows_the_segment_range() {
        let manager = MemoryManager::new(32);
        assert_eq!(manager.segment_limit(), u64::from(u32::MAX));
        assert_eq!(MemoryManager::new(64).segment_limit(), u64::MAX);
    }
}
