//! The per-state address space: a copy-on-write map from memory objects to
//! their byte stores, plus the segment and concrete-address indexes used to
//! resolve pointers.

use crate::expr::{ConstraintSet, Expr, Value};
use crate::memory::{MemoryObject, ObjectState};
use crate::solver::{Solver, SolverError};
use log::trace;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type ObjectPair = (Rc<MemoryObject>, Rc<ObjectState>);
pub type ResolutionList = Vec<ObjectPair>;
/// segment -> pinned host address, for passing memory to external calls.
pub type SegmentAddressMap = HashMap<u64, u64>;

/// A successful single resolution. `adjusted` carries the concrete
/// (segment, offset) to substitute when the pointer was matched through
/// the concrete address map rather than by its segment.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub pair: ObjectPair,
    pub adjusted: Option<(u64, u64)>,
}

/// Host-side buffers external calls read and write, keyed by a synthetic
/// address handed out at allocation time.
#[derive(Debug, Default)]
pub struct HostMemory {
    buffers: HashMap<u64, Vec<u8>>,
    next_address: u64,
}

impl HostMemory {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_address: 0x1000,
        }
    }

    pub fn allocate(&mut self, len: usize) -> u64 {
        let address = self.next_address;
        self.next_address += ((len as u64).max(1) + 0xf) & !0xf;
        self.buffers.insert(address, vec![0; len]);
        address
    }

    pub fn release(&mut self, address: u64) {
        self.buffers.remove(&address);
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        let buffer = self
            .buffers
            .get_mut(&address)
            .expect("write to unallocated host buffer");
        buffer[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn read(&self, address: u64, len: usize) -> &[u8] {
        let buffer = self
            .buffers
            .get(&address)
            .expect("read from unallocated host buffer");
        &buffer[..len]
    }
}

#[derive(Debug, Default)]
pub struct AddressSpace {
    /// Ownership epoch; object states whose owner matches are writeable
    /// in place, all others must be cloned first.
    cow_key: u32,
    /// All bindings, ordered by memory object id.
    objects: BTreeMap<u64, ObjectPair>,
    /// segment -> object id, injective.
    segment_map: HashMap<u64, u64>,
    /// host address -> segment, for fixed and externally visible objects.
    concrete_address_map: BTreeMap<u64, u64>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            cow_key: 1,
            ..Self::default()
        }
    }

    /// Clone for a state branch. Both sides move to a fresh epoch, so all
    /// existing object states become shared until the next write.
    pub fn clone_cow(&mut self) -> AddressSpace {
        self.cow_key += 1;
        AddressSpace {
            cow_key: self.cow_key,
            objects: self.objects.clone(),
            segment_map: self.segment_map.clone(),
            concrete_address_map: self.concrete_address_map.clone(),
        }
    }

    pub fn cow_key(&self) -> u32 {
        self.cow_key
    }

    pub fn bind(&mut self, mo: Rc<MemoryObject>, mut os: ObjectState) {
        assert_eq!(os.copy_on_write_owner, 0, "object state already has an owner");
        os.copy_on_write_owner = self.cow_key;
        if mo.segment != 0 {
            self.segment_map.insert(mo.segment, mo.id);
        }
        if let Some(address) = mo.address {
            self.concrete_address_map.insert(address, mo.segment);
        }
        let prev = self.objects.insert(mo.id, (mo, Rc::new(os)));
        assert!(prev.is_none(), "memory object is already bound");
    }

    pub fn unbind(&mut self, mo: &MemoryObject) {
        if mo.segment != 0 {
            self.segment_map.remove(&mo.segment);
        }
        if let Some(address) = mo.address {
            self.concrete_address_map.remove(&address);
        }
        self.objects.remove(&mo.id);
    }

    pub fn find(&self, mo: &MemoryObject) -> Option<&ObjectPair> {
        self.objects.get(&mo.id)
    }

    pub fn find_by_segment(&self, segment: u64) -> Option<&ObjectPair> {
        let id = self.segment_map.get(&segment)?;
        self.objects.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectPair> {
        self.objects.values()
    }

    /// The object state of `mo`, writeable in place. Clones the state
    /// first when it is still shared with sibling states.
    pub fn writeable(&mut self, mo: &MemoryObject) -> &mut ObjectState {
        let cow_key = self.cow_key;
        let entry = self
            .objects
            .get_mut(&mo.id)
            .expect("writeable() on an unbound object");
        let os = &mut entry.1;
        if os.copy_on_write_owner != cow_key {
            let mut clone = ObjectState::clone(os);
            clone.copy_on_write_owner = cow_key;
            *os = Rc::new(clone);
        }
        Rc::get_mut(os).expect("owned object state is uniquely referenced")
    }

    /// Total bytes backed by this address space, for the memory cap.
    pub fn tracked_bytes(&self) -> u64 {
        self.objects
            .values()
            .map(|(mo, _)| mo.allocated_size)
            .sum()
    }

    fn lookup_segment(&self, segment: u64) -> Option<Resolution> {
        self.find_by_segment(segment).map(|pair| Resolution {
            pair: pair.clone(),
            adjusted: None,
        })
    }

    /// Resolve a fully constant pointer without consulting the solver.
    fn resolve_constant_address(&self, segment: u64, address: u64) -> Option<Resolution> {
        let mut segment = segment;
        let mut adjusted = None;
        if segment == 0 && address != 0 {
            if let Some(mapped) = self.concrete_address_map.get(&address) {
                segment = *mapped;
                adjusted = Some((segment, 0));
            }
        }
        if segment == 0 {
            return None;
        }
        let pair = self.find_by_segment(segment)?.clone();
        Some(Resolution { pair, adjusted })
    }

    /// Resolve `pointer` to at most one in-bounds object.
    ///
    /// Constant pointers go through the segment and concrete-address maps;
    /// a symbolic segment is concretized via `get_value` first; a zero
    /// segment falls back to a walk over the address-ordered objects,
    /// backward then forward from the pointer's anchor value.
    pub fn resolve_one(
        &self,
        constraints: &ConstraintSet,
        solver: &mut dyn Solver,
        pointer: &Value,
    ) -> Result<Option<Resolution>, SolverError> {
        if pointer.is_constant() {
            let segment = pointer.constant_segment().unwrap();
            let address = pointer.offset.as_u64().unwrap_or(0);
            if let Some(resolution) = self.resolve_constant_address(segment, address) {
                return Ok(Some(resolution));
            }
            if segment != 0 {
                return Ok(None);
            }
            return self.scan_addresses(constraints, solver, &pointer.offset, address);
        }

        let segment = match pointer.constant_segment() {
            Some(segment) => segment,
            None => solver.get_value(constraints, &pointer.segment)? as u64,
        };
        if segment != 0 {
            return Ok(self.lookup_segment(segment));
        }

        let anchor = solver.get_value(constraints, &pointer.offset)? as u64;
        self.scan_addresses(constraints, solver, &pointer.offset, anchor)
    }

    /// The backward-then-forward walk over objects with known addresses.
    fn scan_addresses(
        &self,
        constraints: &ConstraintSet,
        solver: &mut dyn Solver,
        offset: &Expr,
        anchor: u64,
    ) -> Result<Option<Resolution>, SolverError> {
        let entries: Vec<(u64, u64)> = self
            .concrete_address_map
            .iter()
            .map(|(address, segment)| (*address, *segment))
            .collect();
        let start = entries.partition_point(|(address, _)| *address <= anchor);

        // backward: candidates whose base lies at or below the anchor
        for i in (0..start).rev() {
            let (base, segment) = entries[i];
            let (mo, _) = match self.find_by_segment(segment) {
                Some(pair) => pair,
                None => continue,
            };
            let in_object = Expr::sub(offset.clone(), Expr::pointer(base));
            let check = mo.bounds_check_offset(&in_object, 1);
            if solver.may_be_true(constraints, &check)? {
                return Ok(Some(self.resolution_at(segment, offset, base, constraints, solver)?));
            }
            let past = Expr::ule(Expr::pointer(base), offset.clone());
            if solver.must_be_true(constraints, &past)? {
                break;
            }
        }

        // forward: candidates above the anchor
        for &(base, segment) in &entries[start..] {
            let below = Expr::ult(offset.clone(), Expr::pointer(base));
            if solver.must_be_true(constraints, &below)? {
                break;
            }
            let (mo, _) = match self.find_by_segment(segment) {
                Some(pair) => pair,
                None => continue,
            };
            let in_object = Expr::sub(offset.clone(), Expr::pointer(base));
            let check = mo.bounds_check_offset(&in_object, 1);
            if solver.may_be_true(constraints, &check)? {
                return Ok(Some(self.resolution_at(segment, offset, base, constraints, solver)?));
            }
        }

        Ok(None)
    }

    fn resolution_at(
        &self,
        segment: u64,
        offset: &Expr,
        base: u64,
        constraints: &ConstraintSet,
        solver: &mut dyn Solver,
    ) -> Result<Resolution, SolverError> {
        let pair = self
            .find_by_segment(segment)
            .expect("scan hit an unbound segment")
            .clone();
        let adjusted = match offset.as_u64() {
            Some(address) => Some((segment, address - base)),
            None => {
                let address = solver.get_value(constraints, offset)? as u64;
                Some((segment, address.saturating_sub(base)))
            }
        };
        Ok(Resolution { pair, adjusted })
    }

    /// Enumerate all objects `pointer` may point into. Returns the list
    /// and whether it is incomplete because `max_resolutions` or the
    /// timeout was hit.
    pub fn resolve(
        &self,
        constraints: &ConstraintSet,
        solver: &mut dyn Solver,
        pointer: &Value,
        max_resolutions: usize,
        timeout: Option<Duration>,
    ) -> Result<(ResolutionList, bool), SolverError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut list = ResolutionList::new();

        if let Some(segment) = pointer.constant_segment() {
            if segment != 0 {
                if let Some(pair) = self.find_by_segment(segment) {
                    list.push(pair.clone());
                }
                return Ok((list, false));
            }
            let incomplete = self.resolve_by_address(
                constraints,
                solver,
                &pointer.offset,
                &mut list,
                max_resolutions,
                deadline,
            )?;
            return Ok((list, incomplete));
        }

        // symbolic segment: the zero-segment case first, then every
        // mapped segment that remains feasible
        let zero = Expr::is_zero(&pointer.segment);
        if solver.may_be_true(constraints, &zero)? {
            let incomplete = self.resolve_by_address(
                constraints,
                solver,
                &pointer.offset,
                &mut list,
                max_resolutions,
                deadline,
            )?;
            if incomplete {
                return Ok((list, true));
            }
        }

        let segments: Vec<u64> = {
            let mut segments: Vec<u64> = self.segment_map.keys().copied().collect();
            segments.sort_unstable();
            segments
        };
        for segment in segments {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Ok((list, true));
                }
            }
            if max_resolutions != 0 && list.len() >= max_resolutions {
                return Ok((list, true));
            }
            let matches = Expr::eq(pointer.segment.clone(), Expr::pointer(segment));
            if solver.may_be_true(constraints, &matches)? {
                if let Some(pair) = self.find_by_segment(segment) {
                    if !list.iter().any(|(mo, _)| mo.id == pair.0.id) {
                        list.push(pair.clone());
                    }
                }
            }
        }
        Ok((list, false))
    }

    fn resolve_by_address(
        &self,
        constraints: &ConstraintSet,
        solver: &mut dyn Solver,
        offset: &Expr,
        list: &mut ResolutionList,
        max_resolutions: usize,
        deadline: Option<Instant>,
    ) -> Result<bool, SolverError> {
        for (base, segment) in &self.concrete_address_map {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Ok(true);
                }
            }
            if max_resolutions != 0 && list.len() >= max_resolutions {
                return Ok(true);
            }
            let pair = match self.find_by_segment(*segment) {
                Some(pair) => pair,
                None => continue,
            };
            let in_object = Expr::sub(offset.clone(), Expr::pointer(*base));
            let check = pair.0.bounds_check_offset(&in_object, 1);
            if solver.may_be_true(constraints, &check)? {
                list.push(pair.clone());
            }
        }
        Ok(false)
    }

    /// Write the concrete bytes of every resolved object out to its host
    /// buffer, ahead of an external call.
    pub fn copy_out_concretes(
        &self,
        resolved: &SegmentAddressMap,
        host: &mut HostMemory,
        ignore_read_only: bool,
    ) {
        for (mo, os) in self.objects.values() {
            let address = match resolved.get(&mo.segment) {
                Some(address) => *address,
                None => continue,
            };
            if mo.is_user_specified {
                continue;
            }
            if os.size_bound() as u64 > mo.allocated_size {
                continue;
            }
            if !os.read_only || ignore_read_only {
                trace!(
                    "copy out: segment {} ({} bytes) -> host {:#x}",
                    mo.segment,
                    os.size_bound(),
                    address
                );
                host.write(address, os.concrete_store());
            }
        }
    }

    /// Read host buffers back into the resolved objects after an external
    /// call. Returns false when a read-only object was modified.
    pub fn copy_in_concretes(&mut self, resolved: &SegmentAddressMap, host: &HostMemory) -> bool {
        let targets: Vec<Rc<MemoryObject>> = self
            .objects
            .values()
            .filter(|(mo, _)| !mo.is_user_specified && resolved.contains_key(&mo.segment))
            .map(|(mo, _)| Rc::clone(mo))
            .collect();

        for mo in targets {
            let address = resolved[&mo.segment];
            let (_, os) = &self.objects[&mo.id];
            let len = os.size_bound();
            let bytes = host.read(address, len);
            if bytes == os.concrete_store() {
                continue;
            }
            if os.read_only {
                return false;
            }
            let bytes = bytes.to_vec();
            self.writeable(&mo).write_concrete_bytes(0, &bytes);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocSite, MemoryManager};
    use crate::solver::native::NativeSolver;

    fn alloc(
        manager: &mut MemoryManager,
        space: &mut AddressSpace,
        size: u64,
    ) -> Rc<MemoryObject> {
        let mo = manager
            .allocate(
                Expr::pointer(size),
                size,
                false,
                false,
                AllocSite::new("test"),
                8,
            )
            .unwrap();
        space.bind(Rc::clone(&mo), ObjectState::new(&mo));
        mo
    }

    #[test]
    fn cow_write_does_not_leak_into_siblings() {
        let mut manager = MemoryManager::new(64);
        let mut parent = AddressSpace::new();
        let mo = alloc(&mut manager, &mut parent, 8);

        parent
            .writeable(&mo)
            .write(&Expr::pointer(0), &Value::constant(64, 1));

        let mut child = parent.clone_cow();
        child
            .writeable(&mo)
            .write(&Expr::pointer(0), &Value::constant(64, 2));

        let mut parent_os = ObjectState::clone(&parent.find(&mo).unwrap().1);
        let mut child_os = ObjectState::clone(&child.find(&mo).unwrap().1);
        assert_eq!(parent_os.read(&Expr::pointer(0), 64).offset.as_u64(), Some(1));
        assert_eq!(child_os.read(&Expr::pointer(0), 64).offset.as_u64(), Some(2));
    }

    #[test]
    fn segment_map_stays_injective() {
        let mut manager = MemoryManager::new(64);
        let mut space = AddressSpace::new();
        let a = alloc(&mut manager, &mut space, 8);
        let b = alloc(&mut manager, &mut space, 8);

        assert_eq!(space.find_by_segment(a.segment).unwrap().0.id, a.id);
        assert_eq!(space.find_by_segment(b.segment).unwrap().0.id, b.id);

        space.unbind(&a);
        assert!(space.find_by_segment(a.segment).is_none());
        assert!(space.find(&a).is_none());
    }

    #[test]
    fn resolve_one_by_segment() {
        let mut manager = MemoryManager::new(64);
        let mut space = AddressSpace::new();
        let mo = alloc(&mut manager, &mut space, 8);

        let mut solver = NativeSolver::new(0);
        let constraints = ConstraintSet::new();
        let pointer = Value::pointer(mo.segment, Expr::pointer(4));
        let resolution = space
            .resolve_one(&constraints, &mut solver, &pointer)
            .unwrap()
            .expect("pointer resolves");
        assert_eq!(resolution.pair.0.id, mo.id);
    }

    #[test]
    fn fixed_objects_resolve_through_addresses() {
        let mut manager = MemoryManager::new(64);
        let mut space = AddressSpace::new();
        let mo = manager.allocate_fixed(0x80, 8, AllocSite::new("fixed"), None, false);
        space.bind(Rc::clone(&mo), ObjectState::new(&mo));

        let mut solver = NativeSolver::new(0);
        let constraints = ConstraintSet::new();

        // exact base address
        let pointer = Value::scalar(Expr::pointer(0x80));
        let resolution = space
            .resolve_one(&constraints, &mut solver, &pointer)
            .unwrap()
            .expect("base resolves");
        assert_eq!(resolution.adjusted, Some((mo.segment, 0)));

        // interior address resolves with its offset
        let pointer = Value::scalar(Expr::pointer(0x84));
        let resolution = space
            .resolve_one(&constraints, &mut solver, &pointer)
            .unwrap()
            .expect("interior resolves");
        assert_eq!(resolution.adjusted, Some((mo.segment, 4)));

        // one past the end does not resolve
        let pointer = Value::scalar(Expr::pointer(0x88));
        assert!(space
            .resolve_one(&constraints, &mut solver, &pointer)
            .unwrap()
            .is_none());
    }

    #[test]
    fn copy_out_copy_in_roundtrip() {
        let mut manager = MemoryManager::new(64);
        let mut space = AddressSpace::new();
        let mo = alloc(&mut manager, &mut space, 4);
        space.writeable(&mo).write_concrete_bytes(0, &[9, 8, 7, 6]);

        let mut host = HostMemory::new();
        let address = host.allocate(4);
        let mut resolved = SegmentAddressMap::new();
        resolved.insert(mo.segment, address);

        space.copy_out_concretes(&resolved, &mut host, false);
        assert_eq!(host.read(address, 4), &[9, 8, 7, 6]);

        assert!(space.copy_in_concretes(&resolved, &host));
        let mut os = ObjectState::clone(&space.find(&mo).unwrap().1);
        assert_eq!(os.read(&Expr::pointer(0), 32).offset.as_u64(), Some(0x0607_0809));
    }

    #[test]
    fn copy_in_detects_read_only_modification() {
        let mut manager = MemoryManager::new(64);
        let mut space = AddressSpace::new();
        let mo = alloc(&mut manager, &mut space, 4);
        space.writeable(&mo).read_only = true;

        let mut host = HostMemory::new();
        let address = host.allocate(4);
        host.write(address, &[1, 2, 3, 4]);
        let mut resolved = SegmentAddressMap::new();
        resolved.insert(mo.segment, address);

        assert!(!space.copy_in_concretes(&resolved, &host));
    }
}
