//! Fixed-capacity arena pools and the mark-and-sweep collector.
//!
//! Cons cells and environment frames live in two independent [`Pool`]s whose
//! capacity is fixed when the interpreter is created. Each pool threads two intrusive
//! singly-linked lists through its slots: the freelist of slots ready for allocation,
//! and the live list of allocated slots. Allocation pops the freelist head and pushes
//! the slot onto the live list, both O(1).
//!
//! Slots are addressed by [`Handle`]s (index + generation). Sweeping a slot bumps its
//! generation, so a handle that outlives its node is detected on access instead of
//! silently reading a recycled slot.
//!
//! Collection is synchronous, stop-the-world and non-moving:
//!
//! 1. unmark every node on each live list,
//! 2. mark everything reachable from the roots collected in a [`Tracer`],
//! 3. sweep each live list, unlinking unmarked nodes onto the freelist.
//!
//! Marking uses explicit worklists, so deep lists and long continuation chains do not
//! recurse on the native stack. Nodes already marked are skipped, which is what makes
//! cyclic structures (mutually recursive closures, frames capturing themselves)
//! terminate and become collectible once unreachable.

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::ast::{Cell, CellRef, ContextRef, Item, Proc};
use crate::evaluator::continuation::Cont;
use crate::evaluator::environment::Context;
use crate::{Error, PoolKind};

/// Generation-checked slot index
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    reachable: bool,
    /// Link in whichever list (free or live) the slot currently belongs to
    next: Option<u32>,
    value: Option<T>,
}

/// A fixed-capacity pool of `T` nodes with intrusive free and live lists.
///
/// Slots are materialized on first use, up to `capacity`; the pool never grows past
/// it. A slot, once created, only ever moves between the free and live lists.
pub struct Pool<T> {
    kind: PoolKind,
    capacity: usize,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live_head: Option<u32>,
    live_len: usize,
}

impl<T> Pool<T> {
    pub fn with_capacity(kind: PoolKind, capacity: usize) -> Self {
        Pool {
            kind,
            capacity: capacity.min(u32::MAX as usize),
            slots: Vec::new(),
            free_head: None,
            live_head: None,
            live_len: 0,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_len(&self) -> usize {
        self.capacity - self.live_len
    }

    pub fn live_len(&self) -> usize {
        self.live_len
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_head.is_none() && self.slots.len() >= self.capacity
    }

    /// Take a slot from the freelist. Returns the value back if the pool is full.
    pub fn alloc(&mut self, value: T) -> Result<Handle, T> {
        let index = match self.free_head {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    reachable: false,
                    next: None,
                    value: None,
                });
                self.free_head = Some((self.slots.len() - 1) as u32);
                (self.slots.len() - 1) as u32
            }
            None => return Err(value),
        };
        let slot = &mut self.slots[index as usize];
        self.free_head = slot.next;
        slot.next = self.live_head;
        slot.reachable = false;
        slot.value = Some(value);
        self.live_head = Some(index);
        self.live_len += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub fn get(&self, handle: Handle) -> Result<&T, Error> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(Error::StaleReference(self.kind))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, Error> {
        let kind = self.kind;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(Error::StaleReference(kind))
    }

    /// Set the reachable flag. Returns true only the first time, so callers can
    /// short-circuit on already visited nodes.
    fn mark(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot)
                if slot.generation == handle.generation
                    && slot.value.is_some()
                    && !slot.reachable =>
            {
                slot.reachable = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        self.slot(handle).is_some_and(|slot| slot.reachable)
    }

    /// Clear the reachable flag of every live node. Returns the number considered.
    fn unmark_all(&mut self) -> usize {
        let mut count = 0;
        let mut cursor = self.live_head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            slot.reachable = false;
            cursor = slot.next;
            count += 1;
        }
        count
    }

    /// Move every unmarked live node to the freelist. Returns the number reclaimed.
    fn sweep(&mut self) -> usize {
        let mut reclaimed = 0;
        let mut prev: Option<u32> = None;
        let mut cursor = self.live_head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            let next = slot.next;
            if slot.reachable {
                prev = Some(index);
            } else {
                slot.value = None;
                slot.generation = slot.generation.wrapping_add(1);
                slot.next = self.free_head;
                self.free_head = Some(index);
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.live_head = next,
                }
                reclaimed += 1;
            }
            cursor = next;
        }
        self.live_len -= reclaimed;
        reclaimed
    }

    /// Handles of live nodes, most recently allocated first
    pub fn live_handles(&self) -> Vec<Handle> {
        let mut handles = Vec::with_capacity(self.live_len);
        let mut cursor = self.live_head;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            handles.push(Handle {
                index,
                generation: slot.generation,
            });
            cursor = slot.next;
        }
        handles
    }
}

/// Root and grey-set collector for a mark phase.
///
/// Everything that must survive a collection is pushed here before marking starts;
/// during marking the same worklists hold nodes discovered but not yet scanned.
#[derive(Default)]
pub struct Tracer {
    items: Vec<Item>,
    contexts: Vec<ContextRef>,
    continuations: Vec<Cont>,
    seen_continuations: HashSet<*const ()>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(&mut self, item: &Item) {
        match item {
            Item::Cell(Some(_)) | Item::Proc(_) => self.items.push(item.clone()),
            Item::Number(_) | Item::Symbol(_) | Item::Cell(None) | Item::Unspecified => {}
        }
    }

    pub fn context(&mut self, context: ContextRef) {
        self.contexts.push(context);
    }

    pub fn continuation(&mut self, k: &Cont) {
        let key = std::rc::Rc::as_ptr(k) as *const ();
        if self.seen_continuations.insert(key) {
            self.continuations.push(k.clone());
        }
    }
}

/// Counts from one collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    pub cells_considered: usize,
    pub contexts_considered: usize,
    pub cells_reclaimed: usize,
    pub contexts_reclaimed: usize,
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "considered {} cells and {} contexts, reclaimed {} cells and {} contexts",
            self.cells_considered,
            self.contexts_considered,
            self.cells_reclaimed,
            self.contexts_reclaimed
        )
    }
}

/// The two node pools of the runtime.
pub struct Heap {
    pub(crate) cells: Pool<Cell>,
    pub(crate) contexts: Pool<Context>,
}

impl Heap {
    pub fn new(cell_capacity: usize, context_capacity: usize) -> Self {
        Heap {
            cells: Pool::with_capacity(PoolKind::Cells, cell_capacity),
            contexts: Pool::with_capacity(PoolKind::Contexts, context_capacity),
        }
    }

    /// Allocate a cell without collecting. `None` when the pool is full.
    pub fn alloc_cell(&mut self, car: Item, cdr: Item) -> Option<CellRef> {
        self.cells.alloc(Cell { car, cdr }).ok().map(CellRef)
    }

    /// Allocate an empty frame without collecting. `None` when the pool is full.
    pub fn alloc_context(&mut self, outer: Option<ContextRef>) -> Option<ContextRef> {
        self.contexts.alloc(Context::new(outer)).ok().map(ContextRef)
    }

    pub fn cell(&self, cell: CellRef) -> Result<&Cell, Error> {
        self.cells.get(cell.0)
    }

    pub fn context(&self, context: ContextRef) -> Result<&Context, Error> {
        self.contexts.get(context.0)
    }

    pub fn context_mut(&mut self, context: ContextRef) -> Result<&mut Context, Error> {
        self.contexts.get_mut(context.0)
    }

    pub fn live_cells(&self) -> usize {
        self.cells.live_len()
    }

    pub fn free_cells(&self) -> usize {
        self.cells.free_len()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.live_len()
    }

    pub fn free_contexts(&self) -> usize {
        self.contexts.free_len()
    }

    pub fn is_marked(&self, cell: CellRef) -> bool {
        self.cells.is_marked(cell.0)
    }

    /// Run a full collection over both pools, keeping everything reachable from the
    /// roots in `tracer`.
    pub fn collect(&mut self, mut tracer: Tracer) -> GcStats {
        let cells_considered = self.cells.unmark_all();
        let contexts_considered = self.contexts.unmark_all();

        self.mark(&mut tracer);

        let stats = GcStats {
            cells_considered,
            contexts_considered,
            cells_reclaimed: self.cells.sweep(),
            contexts_reclaimed: self.contexts.sweep(),
        };
        debug!(
            cells_considered = stats.cells_considered,
            contexts_considered = stats.contexts_considered,
            cells_reclaimed = stats.cells_reclaimed,
            contexts_reclaimed = stats.contexts_reclaimed,
            "garbage collection finished"
        );
        stats
    }

    fn mark(&mut self, tracer: &mut Tracer) {
        loop {
            if let Some(context) = tracer.contexts.pop() {
                if self.contexts.mark(context.0)
                    && let Ok(frame) = self.contexts.get(context.0)
                {
                    for value in frame.bindings.values() {
                        tracer.item(value);
                    }
                    if let Some(outer) = frame.outer {
                        tracer.context(outer);
                    }
                }
                continue;
            }

            if let Some(item) = tracer.items.pop() {
                match item {
                    Item::Cell(Some(cell)) => {
                        if self.cells.mark(cell.0)
                            && let Ok(node) = self.cells.get(cell.0)
                        {
                            tracer.item(&node.car);
                            tracer.item(&node.cdr);
                        }
                    }
                    Item::Proc(Proc::Closure { code, closure }) => {
                        tracer.item(&Item::Cell(Some(code)));
                        tracer.context(closure);
                    }
                    Item::Proc(Proc::Continuation(escape)) => {
                        tracer.continuation(escape.continuation());
                    }
                    Item::Proc(Proc::Native(_))
                    | Item::Number(_)
                    | Item::Symbol(_)
                    | Item::Cell(None)
                    | Item::Unspecified => {}
                }
                continue;
            }

            if let Some(k) = tracer.continuations.pop() {
                k.trace(tracer);
                continue;
            }

            break;
        }
    }

    /// `car` of a non-empty list; anything else is a type mismatch
    pub fn car(&self, item: &Item) -> Result<Item, Error> {
        match item {
            Item::Cell(Some(cell)) => Ok(self.cell(*cell)?.car.clone()),
            other => Err(Error::eval(
                crate::EvalErrorKind::TypeMismatch,
                format!("car expects a pair, got {}", other.tag_name()),
            )),
        }
    }

    /// `cdr` of a non-empty list; anything else is a type mismatch
    pub fn cdr(&self, item: &Item) -> Result<Item, Error> {
        match item {
            Item::Cell(Some(cell)) => Ok(self.cell(*cell)?.cdr.clone()),
            other => Err(Error::eval(
                crate::EvalErrorKind::TypeMismatch,
                format!("cdr expects a pair, got {}", other.tag_name()),
            )),
        }
    }

    /// Split a pair into `(car, cdr)`; `None` for anything that is not a pair
    pub fn uncons(&self, item: &Item) -> Result<Option<(Item, Item)>, Error> {
        match item {
            Item::Cell(Some(cell)) => {
                let node = self.cell(*cell)?;
                Ok(Some((node.car.clone(), node.cdr.clone())))
            }
            _ => Ok(None),
        }
    }

    /// Collect a proper list into a Vec. Returns None if not a proper list.
    pub fn list_to_vec(&self, item: &Item) -> Result<Option<Vec<Item>>, Error> {
        let mut result = Vec::new();
        let mut current = item.clone();
        loop {
            match current {
                Item::Cell(None) => return Ok(Some(result)),
                Item::Cell(Some(cell)) => {
                    let node = self.cell(cell)?;
                    result.push(node.car.clone());
                    current = node.cdr.clone();
                }
                _ => return Ok(None),
            }
        }
    }

    /// Number of cells in the `cdr` chain. An improper tail is not counted.
    pub fn length(&self, item: &Item) -> Result<usize, Error> {
        let mut count = 0;
        let mut current = item.clone();
        while let Item::Cell(Some(cell)) = current {
            count += 1;
            current = self.cell(cell)?.cdr.clone();
        }
        Ok(count)
    }

    /// Structural equality: pairs are compared element-wise, everything else with
    /// shallow equality.
    pub fn deep_equal(&self, a: &Item, b: &Item) -> Result<bool, Error> {
        let mut pending = vec![(a.clone(), b.clone())];
        while let Some((x, y)) = pending.pop() {
            match (&x, &y) {
                (Item::Cell(Some(cx)), Item::Cell(Some(cy))) => {
                    if cx == cy {
                        continue;
                    }
                    let (nx, ny) = (self.cell(*cx)?, self.cell(*cy)?);
                    pending.push((nx.cdr.clone(), ny.cdr.clone()));
                    pending.push((nx.car.clone(), ny.car.clone()));
                }
                _ => {
                    if x != y {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}
