//! Lock-free singly-linked list with sentinel-tagged links.
//!
//! Every `next` link is an `AtomicPtr` whose value at any instant is one of:
//!
//! | Value  | Meaning |
//! |--------|---------|
//! | node   | live successor |
//! | null   | end of chain |
//! | `SPIN` | the link is mid-edit; reload until a live value appears |
//! | `DEAD` | the owning node was detached; the link never goes live again |
//!
//! The sentinels are addresses of two static cells, so they are unique,
//! non-null, and never equal to a heap allocation. They are compared, never
//! dereferenced.
//!
//! ## Synchronization
//!
//! A writer *locks* a link by CAS-ing its current value to `SPIN` and must
//! follow up with exactly one store of a non-sentinel value (or `DEAD`, for a
//! detach) before anyone else can take the link. Readers that hit `SPIN`
//! reload with a [`Backoff`]. `DEAD` is absorbing: operations that land on it
//! either give up ([`insert_after`](LockFreeForwardList::insert_after) returns
//! `None`) or restart from the head ([`concat`](LockFreeForwardList::concat)).
//!
//! ## Reference counting
//!
//! Each node carries an atomic count: one reference for the link that points
//! at it, plus one per live [`Cursor`]. A node is freed exactly when the count
//! reaches zero, which is what lets a cursor keep reading a node that a
//! concurrent [`pop_front`](LockFreeForwardList::pop_front) already detached.
//! For the same reason the reading operations clone values out instead of
//! moving them; the original value dies with its node.
//!
//! ## Memory orders
//!
//! The plain methods are sequentially consistent. Each has an `_ordered` twin
//! taking explicit load/store orders; [`combine_order`] derives the strongest
//! compatible order for the read-modify-writes on reference counts.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// Address-unique sentinel storage. Only the addresses matter.
#[repr(align(8))]
struct Sentinel(#[allow(dead_code)] u8);

static SPIN_SENTINEL: Sentinel = Sentinel(0);
static DEAD_SENTINEL: Sentinel = Sentinel(1);

#[inline]
fn spin_mark<T>() -> *mut ListNode<T> {
    &raw const SPIN_SENTINEL as *mut ListNode<T>
}

#[inline]
fn dead_mark<T>() -> *mut ListNode<T> {
    &raw const DEAD_SENTINEL as *mut ListNode<T>
}

/// True for a dereferenceable node pointer (non-null, not a sentinel).
#[inline]
fn is_live<T>(p: *mut ListNode<T>) -> bool {
    !p.is_null() && p != spin_mark() && p != dead_mark()
}

/// Strongest memory order compatible with `load` and `store` for a single
/// read-modify-write:
///
/// - `SeqCst` if either side is `SeqCst`
/// - `AcqRel` for an acquiring load paired with a releasing store
/// - the load order when the store is `Relaxed`
/// - otherwise the store order
pub fn combine_order(load: Ordering, store: Ordering) -> Ordering {
    use Ordering::*;
    match (load, store) {
        (SeqCst, _) | (_, SeqCst) => SeqCst,
        (Acquire | AcqRel, Release | AcqRel) => AcqRel,
        (Acquire | AcqRel, Relaxed) => load,
        _ => store,
    }
}

struct ListNode<T> {
    value: T,
    next: AtomicPtr<ListNode<T>>,
    refs: AtomicUsize,
}

impl<T> ListNode<T> {
    /// Heap-allocates a node holding one reference (the link that will point
    /// at it).
    fn alloc(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
            refs: AtomicUsize::new(1),
        }))
    }
}

/// Raises `n`'s reference count and hands the pointer back.
///
/// # Safety
///
/// `n` must be live and the caller must already be prevented from racing with
/// the final [`lose`] (by holding a reference of its own, or by holding the
/// link that points at `n` in the locked state).
unsafe fn gain<T>(n: *mut ListNode<T>, load: Ordering, store: Ordering) -> *mut ListNode<T> {
    debug_assert!(is_live(n));
    unsafe { (*n).refs.fetch_add(1, combine_order(load, store)) };
    n
}

/// Drops one reference; frees the node when the count reaches zero.
///
/// # Safety
///
/// `n` must be null or live, and the caller must own one reference to it.
unsafe fn lose<T>(n: *mut ListNode<T>, load: Ordering, store: Ordering) {
    if n.is_null() {
        return;
    }
    debug_assert!(is_live(n));
    if unsafe { (*n).refs.fetch_sub(1, combine_order(load, store)) } == 1 {
        // Last reference: nothing can reach the node anymore, and its link
        // was tombstoned (or never published) before the link reference died.
        let next = unsafe { (*n).next.load(Ordering::Relaxed) };
        debug_assert!(next.is_null() || next == dead_mark());
        drop(unsafe { Box::from_raw(n) });
    }
}

struct Dead;

/// Locks `slot` by swapping in the spin mark; returns the previous value,
/// which is live or null. The caller must restore a non-spin value with
/// [`unlock_slot`]. Spins while another thread holds the mark.
///
/// For links that can be tombstoned concurrently use [`try_lock_slot`]; this
/// variant is for the head and for links the caller already holds exclusively.
fn lock_slot<T>(slot: &AtomicPtr<ListNode<T>>, load: Ordering) -> *mut ListNode<T> {
    match try_lock_slot(slot, load) {
        Ok(prev) => prev,
        Err(Dead) => unreachable!("locked a link that cannot be dead"),
    }
}

/// Like [`lock_slot`], but observes the tombstone instead of asserting it
/// away.
fn try_lock_slot<T>(
    slot: &AtomicPtr<ListNode<T>>,
    load: Ordering,
) -> Result<*mut ListNode<T>, Dead> {
    let backoff = Backoff::new();
    let mut seen = slot.load(load);
    loop {
        while seen == spin_mark() {
            backoff.snooze();
            seen = slot.load(load);
        }
        if seen == dead_mark() {
            return Err(Dead);
        }
        // Relaxed success order: taking the mark publishes nothing by itself;
        // the value of interest was read with the caller's load order.
        match slot.compare_exchange_weak(seen, spin_mark(), Ordering::Relaxed, load) {
            Ok(prev) => return Ok(prev),
            Err(actual) => seen = actual,
        }
    }
}

/// Releases a slot previously locked with [`lock_slot`]/[`try_lock_slot`],
/// publishing `value`.
fn unlock_slot<T>(slot: &AtomicPtr<ListNode<T>>, value: *mut ListNode<T>, store: Ordering) {
    debug_assert_eq!(slot.load(Ordering::Relaxed), spin_mark());
    slot.store(value, store);
}

/// Atomically swaps `value` into `slot` and returns the previous live-or-null
/// pointer. Lock-free: spins only while the slot carries the spin mark.
fn exchange_slot<T>(
    slot: &AtomicPtr<ListNode<T>>,
    value: *mut ListNode<T>,
    load: Ordering,
    store: Ordering,
) -> *mut ListNode<T> {
    let backoff = Backoff::new();
    let mut seen = slot.load(load);
    loop {
        while seen == spin_mark() {
            backoff.snooze();
            seen = slot.load(load);
        }
        debug_assert_ne!(seen, dead_mark::<T>());
        match slot.compare_exchange_weak(seen, value, store, load) {
            Ok(prev) => return prev,
            Err(actual) => seen = actual,
        }
    }
}

/// Locks `slot`, gains a reference on the successor it holds, unlocks, and
/// returns the gained pointer (null for end of chain).
fn try_lock_gain_unlock<T>(
    slot: &AtomicPtr<ListNode<T>>,
    load: Ordering,
    store: Ordering,
) -> Result<*mut ListNode<T>, Dead> {
    let prev = try_lock_slot(slot, load)?;
    let gained = if prev.is_null() {
        ptr::null_mut()
    } else {
        // The locked link still owns its reference, so the node cannot be
        // freed under us.
        unsafe { gain(prev, load, store) }
    };
    unlock_slot(slot, prev, store);
    Ok(gained)
}

/// Thread-safe singly-linked list: concurrent `push_front`, `pop_front`,
/// cursor iteration, interior insert/erase, `clear`, `separate_after` and
/// `concat`, with the sentinel protocol described in the [module docs](self).
pub struct LockFreeForwardList<T> {
    head: CachePadded<AtomicPtr<ListNode<T>>>,
    _owns: PhantomData<T>,
}

// The list owns its values and hands out only clones and short-lived
// references guarded by node reference counts.
unsafe impl<T: Send> Send for LockFreeForwardList<T> {}
unsafe impl<T: Send + Sync> Sync for LockFreeForwardList<T> {}

impl<T> LockFreeForwardList<T> {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            _owns: PhantomData,
        }
    }

    /// Whether the list is empty. A link mid-edit counts as non-empty.
    pub fn is_empty(&self) -> bool {
        self.is_empty_ordered(Ordering::SeqCst)
    }

    pub fn is_empty_ordered(&self, load: Ordering) -> bool {
        self.head.load(load).is_null()
    }

    /// Prepends `value`. Lock-free: the head swap never waits on other
    /// writers; the new node's own link is primed with the spin mark so a
    /// reader that finds the node before its successor is wired waits out the
    /// gap.
    pub fn push_front(&self, value: T) {
        self.push_front_ordered(value, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn push_front_ordered(&self, value: T, load: Ordering, store: Ordering) {
        let n = ListNode::alloc(value);
        unsafe { (*n).next.store(spin_mark(), Ordering::Relaxed) };
        let prev = exchange_slot(&self.head, n, load, store);
        unsafe { unlock_slot(&(*n).next, prev, store) };
    }

    /// Removes the front node and returns (a clone of) its value, or `None`
    /// on an empty list. The head is never tombstoned, so every thread that
    /// keeps popping observes the list as eventually empty.
    pub fn pop_front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.pop_front_ordered(Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn pop_front_ordered(&self, load: Ordering, store: Ordering) -> Option<T>
    where
        T: Clone,
    {
        let first = lock_slot(&self.head, load);
        if first.is_null() {
            unlock_slot(&self.head, ptr::null_mut(), store);
            return None;
        }
        let value = unsafe { (*first).value.clone() };
        // Holding the head mark makes us the only detacher of `first`, so its
        // link cannot be dead.
        let second = unsafe { lock_slot(&(*first).next, load) };
        // The successor's link reference moves from `first` into the head.
        unlock_slot(&self.head, second, store);
        unsafe { unlock_slot(&(*first).next, dead_mark(), store) };
        unsafe { lose(first, load, store) };
        Some(value)
    }

    /// Clone of the front value, if any.
    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.cursor().get().cloned()
    }

    /// Detaches the whole chain in one swap and tears it down iteratively
    /// (a recursive drop would overflow the stack on long chains). Returns
    /// the number of nodes dropped. Racing pushes may or may not make it into
    /// the detached chain; see [`locked_clear`](Self::locked_clear) for the
    /// all-or-nothing variant.
    pub fn clear(&self) -> usize {
        self.clear_ordered(Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn clear_ordered(&self, load: Ordering, store: Ordering) -> usize {
        let mut chain = exchange_slot(&self.head, ptr::null_mut(), load, store);
        let mut dropped = 0;
        while !chain.is_null() {
            let next = unsafe { lock_slot(&(*chain).next, load) };
            unsafe { unlock_slot(&(*chain).next, dead_mark(), store) };
            unsafe { lose(chain, load, store) };
            dropped += 1;
            chain = next;
        }
        dropped
    }

    /// All-or-nothing clear: primes the head and every interior link with the
    /// spin mark before detaching anything, so racing pushes and inserts
    /// stall until the whole chain is gone rather than slipping into it.
    /// Returns the number of nodes dropped.
    pub fn locked_clear(&self) -> usize {
        self.locked_clear_ordered(Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn locked_clear_ordered(&self, load: Ordering, store: Ordering) -> usize {
        let first = lock_slot(&self.head, load);
        let mut held: Vec<*mut ListNode<T>> = Vec::new();
        let mut cur = first;
        while !cur.is_null() {
            let next = unsafe { lock_slot(&(*cur).next, load) };
            held.push(cur);
            cur = next;
        }
        // Every link in the chain is marked; detach and tombstone in one
        // sweep.
        unlock_slot(&self.head, ptr::null_mut(), store);
        let dropped = held.len();
        for node in held {
            unsafe { unlock_slot(&(*node).next, dead_mark(), store) };
            unsafe { lose(node, load, store) };
        }
        dropped
    }

    /// Inserts `value` after the cursor position. Returns a cursor to the new
    /// node, or `None` when the position has been detached from the list (its
    /// link carries the tombstone).
    pub fn insert_after<'a>(&'a self, position: &Cursor<'a, T>, value: T) -> Option<Cursor<'a, T>> {
        self.insert_after_ordered(position, value, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn insert_after_ordered<'a>(
        &'a self,
        position: &Cursor<'a, T>,
        value: T,
        load: Ordering,
        store: Ordering,
    ) -> Option<Cursor<'a, T>> {
        let at = position.current;
        if at.is_null() {
            return None;
        }
        let slot = unsafe { &(*at).next };
        let prev = match try_lock_slot(slot, load) {
            Ok(prev) => prev,
            Err(Dead) => return None,
        };
        let n = ListNode::alloc(value);
        // The node is unpublished until the unlock below, so plain stores are
        // enough to wire its successor.
        unsafe { (*n).next.store(prev, Ordering::Relaxed) };
        // Gain the cursor's reference before publication so a racing pop
        // cannot free the node first.
        let gained = unsafe { gain(n, load, store) };
        unlock_slot(slot, n, store);
        Some(Cursor {
            current: gained,
            _list: PhantomData,
        })
    }

    /// Removes the node after the cursor position and returns (a clone of)
    /// its value. `None` when the position is the tail, detached, or the end
    /// cursor.
    pub fn erase_after(&self, position: &Cursor<'_, T>) -> Option<T>
    where
        T: Clone,
    {
        self.erase_after_ordered(position, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn erase_after_ordered(
        &self,
        position: &Cursor<'_, T>,
        load: Ordering,
        store: Ordering,
    ) -> Option<T>
    where
        T: Clone,
    {
        let at = position.current;
        if at.is_null() {
            return None;
        }
        let slot = unsafe { &(*at).next };
        let x = match try_lock_slot(slot, load) {
            Ok(x) => x,
            Err(Dead) => return None,
        };
        if x.is_null() {
            unlock_slot(slot, ptr::null_mut(), store);
            return None;
        }
        let value = unsafe { (*x).value.clone() };
        // We hold the only link into `x`, so `x` cannot be detached by anyone
        // else and its own link cannot be dead.
        let y = unsafe { lock_slot(&(*x).next, load) };
        unlock_slot(slot, y, store);
        unsafe { unlock_slot(&(*x).next, dead_mark(), store) };
        unsafe { lose(x, load, store) };
        Some(value)
    }

    /// Swaps everything after the cursor position off into a new list.
    /// `None` when the position is detached, the end cursor, or already the
    /// tail.
    pub fn separate_after(&self, position: &Cursor<'_, T>) -> Option<Self> {
        self.separate_after_ordered(position, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn separate_after_ordered(
        &self,
        position: &Cursor<'_, T>,
        load: Ordering,
        store: Ordering,
    ) -> Option<Self> {
        let at = position.current;
        if at.is_null() {
            return None;
        }
        let slot = unsafe { &(*at).next };
        let tail = match try_lock_slot(slot, load) {
            Ok(tail) => tail,
            Err(Dead) => return None,
        };
        unlock_slot(slot, ptr::null_mut(), store);
        if tail.is_null() {
            return None;
        }
        let list = Self::new();
        // The tail's link reference transfers into the new list's head.
        list.head.store(tail, store);
        Some(list)
    }

    /// Splices every node of `other` onto the tail of `self`, preserving
    /// order. The walk advances under per-link marks with a gained reference
    /// on the node it stands on; finding a tombstone (the node under us got
    /// detached) restarts from the head.
    pub fn concat(&self, other: Self) {
        self.concat_ordered(other, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn concat_ordered(&self, other: Self, load: Ordering, store: Ordering) {
        let chain = exchange_slot(&other.head, ptr::null_mut(), load, store);
        if chain.is_null() {
            return;
        }
        let mut holder: *mut ListNode<T> = ptr::null_mut();
        loop {
            let slot = if holder.is_null() {
                &*self.head
            } else {
                unsafe { &(*holder).next }
            };
            match try_lock_slot(slot, load) {
                Err(Dead) => {
                    // The node we stand on was detached; start over.
                    unsafe { lose(holder, load, store) };
                    holder = ptr::null_mut();
                }
                Ok(p) if p.is_null() => {
                    // Found the tail; the chain's link reference moves in.
                    unlock_slot(slot, chain, store);
                    unsafe { lose(holder, load, store) };
                    return;
                }
                Ok(p) => {
                    let next = unsafe { gain(p, load, store) };
                    unlock_slot(slot, p, store);
                    unsafe { lose(holder, load, store) };
                    holder = next;
                }
            }
        }
    }

    /// A cursor standing on the front node (or the end cursor for an empty
    /// list). Cursor construction gains a reference, so the node outlives any
    /// concurrent detach.
    pub fn cursor(&self) -> Cursor<'_, T> {
        self.cursor_ordered(Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn cursor_ordered(&self, load: Ordering, store: Ordering) -> Cursor<'_, T> {
        let n = match try_lock_gain_unlock(&self.head, load, store) {
            Ok(n) => n,
            Err(Dead) => unreachable!("the head link is never dead"),
        };
        Cursor {
            current: n,
            _list: PhantomData,
        }
    }

    /// Iterates over clones of the values, front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cursor: self.cursor(),
            started: false,
        }
    }
}

impl<T> Default for LockFreeForwardList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeForwardList<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A reference-counted position in a [`LockFreeForwardList`].
///
/// Holding a cursor keeps its node (and the value inside) alive even if the
/// node is concurrently detached. [`advance`](Self::advance) steps to the
/// successor under the link mark, so it never observes a half-wired link;
/// advancing off a detached node ends the walk, because the old successor now
/// belongs to another link.
pub struct Cursor<'a, T> {
    /// Gained node pointer, or null for the end cursor.
    current: *mut ListNode<T>,
    _list: PhantomData<&'a LockFreeForwardList<T>>,
}

unsafe impl<T: Send + Sync> Send for Cursor<'_, T> {}
unsafe impl<T: Send + Sync> Sync for Cursor<'_, T> {}

impl<'a, T> Cursor<'a, T> {
    /// The value under the cursor, or `None` for the end cursor.
    pub fn get(&self) -> Option<&T> {
        if self.current.is_null() {
            None
        } else {
            Some(unsafe { &(*self.current).value })
        }
    }

    /// Whether this is the end cursor.
    pub fn is_end(&self) -> bool {
        self.current.is_null()
    }

    /// Steps to the successor; returns whether the cursor still stands on a
    /// node afterwards.
    pub fn advance(&mut self) -> bool {
        self.advance_ordered(Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn advance_ordered(&mut self, load: Ordering, store: Ordering) -> bool {
        if self.current.is_null() {
            return false;
        }
        let slot = unsafe { &(*self.current).next };
        let next = match try_lock_gain_unlock(slot, load, store) {
            Ok(next) => next,
            // Detached under us: the successor belongs to another link now.
            Err(Dead) => ptr::null_mut(),
        };
        let prev = mem::replace(&mut self.current, next);
        unsafe { lose(prev, load, store) };
        !self.current.is_null()
    }
}

impl<T> Clone for Cursor<'_, T> {
    fn clone(&self) -> Self {
        if !self.current.is_null() {
            unsafe { gain(self.current, Ordering::SeqCst, Ordering::SeqCst) };
        }
        Self {
            current: self.current,
            _list: PhantomData,
        }
    }
}

impl<T> PartialEq for Cursor<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.current == other.current
    }
}

impl<T> Eq for Cursor<'_, T> {}

impl<T> Drop for Cursor<'_, T> {
    fn drop(&mut self) {
        unsafe { lose(self.current, Ordering::SeqCst, Ordering::SeqCst) };
    }
}

/// Cloning iterator over a [`LockFreeForwardList`].
pub struct Iter<'a, T> {
    cursor: Cursor<'a, T>,
    started: bool,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.started {
            self.cursor.advance();
        } else {
            self.started = true;
        }
        self.cursor.get().cloned()
    }
}
