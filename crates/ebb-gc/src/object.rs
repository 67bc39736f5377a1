//! Object model: headers, tagged fields, and the per-kind scan dispatch.
//!
//! An object is a variable-size record with a fixed header followed by a body
//! of one-word fields. Which body words hold pointers is decided by the
//! object's kind tag; the collector dispatches through a table of scan
//! functions built once at heap initialization instead of per-kind visitor
//! types.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One machine word per field.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Size of [`ObjectHeader`], also the offset of the first body field.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

// ============================================================================
// Object kinds
// ============================================================================

/// Kind tag stored in every object header; indexes the scan dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// Every body word is a tagged field.
    Plain = 0,
    /// The first `raw_words` body words are untyped payload, the rest tagged.
    Mixed = 1,
    /// Like `Plain`, but large enough that the write barrier prefers
    /// re-scanning the host over enqueueing each stored value.
    ProgressBar = 2,
    /// Key/value pair; the value is reachable only through a live key.
    Ephemeron = 3,
    /// Weak reference plus an observer token; never retains its target.
    WeakCell = 4,
    /// Type descriptor; its back-pointer and transition links are all weak.
    Shape = 5,
    /// Immutable byte string; participates in the intern table.
    Str = 6,
}

/// Number of kinds, i.e. the scan table length.
pub const KIND_COUNT: usize = 7;

impl ObjectKind {
    /// Decode a kind tag read from an object header.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Plain),
            1 => Some(Self::Mixed),
            2 => Some(Self::ProgressBar),
            3 => Some(Self::Ephemeron),
            4 => Some(Self::WeakCell),
            5 => Some(Self::Shape),
            6 => Some(Self::Str),
            _ => None,
        }
    }
}

/// Field index of an ephemeron's key.
pub const EPHEMERON_KEY: usize = 0;
/// Field index of an ephemeron's value.
pub const EPHEMERON_VALUE: usize = 1;
/// Field index of a weak cell's target.
pub const WEAK_CELL_TARGET: usize = 0;
/// Field index of a weak cell's observer token (immediate).
pub const WEAK_CELL_TOKEN: usize = 1;
/// Field index of a shape's back-pointer.
pub const SHAPE_BACK_POINTER: usize = 0;

// ============================================================================
// Tagged words
// ============================================================================

/// A one-word field value: low bit set means heap pointer, clear means
/// immediate payload in the upper bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedWord(usize);

impl TaggedWord {
    /// The immediate zero; also what cleared weak links are set to.
    pub const NULL: Self = Self(0);

    /// Tag an object address.
    #[must_use]
    pub fn from_object(obj: ObjRef) -> Self {
        Self(obj.addr() | 1)
    }

    /// Tag an immediate payload (loses the top bit).
    #[must_use]
    pub const fn from_immediate(v: usize) -> Self {
        Self(v << 1)
    }

    /// Rebuild from a raw word, e.g. one read back out of object memory.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw word as stored in memory.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this word refers to a heap object.
    #[must_use]
    pub const fn is_pointer(self) -> bool {
        self.0 & 1 == 1
    }

    /// The referenced object, if this word is a pointer.
    #[must_use]
    pub fn as_object(self) -> Option<ObjRef> {
        if self.is_pointer() {
            NonNull::new((self.0 & !1) as *mut u8).map(ObjRef)
        } else {
            None
        }
    }

    /// Immediate payload; garbage if `is_pointer()`.
    #[must_use]
    pub const fn immediate(self) -> usize {
        self.0 >> 1
    }
}

// ============================================================================
// Object header
// ============================================================================

/// Fixed header at the start of every object.
///
/// The color does **not** live here; it lives in the page's color bitmap.
/// The forwarding word is 0 for objects that have not been relocated and the
/// new address otherwise. It is only ever written during evacuation, while
/// the mutator is stopped, and read during pointer fix-up.
#[repr(C)]
pub struct ObjectHeader {
    /// Kind tag, see [`ObjectKind`].
    pub kind: u8,
    /// Object-level flags; currently unused beyond debugging.
    pub flags: u8,
    /// For `Mixed`: number of leading untyped body words.
    pub raw_words: u16,
    /// Total size in bytes, header included.
    pub size: u32,
    /// New address after relocation, 0 if in place.
    pub forwarding: AtomicUsize,
}

/// A reference to an object: the address of its header.
///
/// Only the heap constructs these; embedders receive them from `allocate`
/// and hand them back through the heap API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) NonNull<u8>);

// SAFETY: an ObjRef is an address. Background tasks only dereference it for
// pages they exclusively own during a cycle phase; the state machine keeps
// discovery and movement from overlapping.
unsafe impl Send for ObjRef {}
// SAFETY: see Send.
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// Rebuild a reference from a raw address (e.g. a forwarding word).
    ///
    /// # Safety
    ///
    /// `addr` must be the address of a live object header.
    #[must_use]
    pub(crate) const unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: caller guarantees addr is a valid, nonzero object address.
        Self(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// The raw address of the header.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn header(self) -> &'static ObjectHeader {
        // SAFETY: ObjRef is only constructed for object starts inside live
        // pages; the header is valid for the page's lifetime.
        unsafe { &*self.0.as_ptr().cast::<ObjectHeader>() }
    }

    /// The object's kind tag.
    #[must_use]
    pub fn kind(self) -> ObjectKind {
        ObjectKind::from_u8(self.header().kind).expect("corrupt kind tag")
    }

    /// Total size in bytes, header included.
    #[must_use]
    pub fn size(self) -> usize {
        self.header().size as usize
    }

    /// Number of one-word body fields.
    #[must_use]
    pub fn field_count(self) -> usize {
        (self.size() - HEADER_SIZE) / WORD_SIZE
    }

    /// Leading untyped body words (`Mixed` only; 0 otherwise).
    #[must_use]
    pub fn raw_words(self) -> usize {
        self.header().raw_words as usize
    }

    /// Address of body field `index`.
    #[must_use]
    pub fn slot(self, index: usize) -> SlotAddr {
        debug_assert!(index < self.field_count());
        // SAFETY: index is within the body, which follows the header.
        let ptr = unsafe { self.0.as_ptr().add(HEADER_SIZE + index * WORD_SIZE) };
        // SAFETY: derived from a NonNull base.
        SlotAddr(unsafe { NonNull::new_unchecked(ptr.cast()) })
    }

    /// Read body field `index`.
    #[must_use]
    pub fn field(self, index: usize) -> TaggedWord {
        self.slot(index).read()
    }

    /// Write body field `index` **without** a write barrier.
    ///
    /// Only the collector and object initialization may use this; mutator
    /// stores go through `Heap::write_barrier`.
    pub(crate) fn set_field_unbarriered(self, index: usize, value: TaggedWord) {
        self.slot(index).write(value);
    }

    /// The forwarding address if this object has been relocated.
    #[must_use]
    pub fn forwarded(self) -> Option<ObjRef> {
        let fwd = self.header().forwarding.load(Ordering::Acquire);
        if fwd == 0 {
            None
        } else {
            // SAFETY: a nonzero forwarding word is always a copy's address.
            Some(unsafe { Self::from_addr(fwd) })
        }
    }

    /// Install a forwarding word pointing at `target`.
    pub(crate) fn set_forwarding(self, target: ObjRef) {
        self.header().forwarding.store(target.addr(), Ordering::Release);
    }

    /// Reset the forwarding word (fresh copies start unrelocated).
    pub(crate) fn clear_forwarding(self) {
        self.header().forwarding.store(0, Ordering::Release);
    }
}

/// The address of one tagged field inside an object body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotAddr(pub(crate) NonNull<TaggedWord>);

// SAFETY: see ObjRef.
unsafe impl Send for SlotAddr {}
// SAFETY: see ObjRef.
unsafe impl Sync for SlotAddr {}

impl SlotAddr {
    /// Rebuild from a raw address recorded in a remembered set.
    ///
    /// # Safety
    ///
    /// `addr` must be a field address inside a live object.
    #[must_use]
    pub(crate) const unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: caller guarantees validity.
        Self(unsafe { NonNull::new_unchecked(addr as *mut TaggedWord) })
    }

    /// The raw slot address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Read the word stored at this slot.
    #[must_use]
    pub fn read(self) -> TaggedWord {
        // SAFETY: slot addresses are only created for fields of live objects.
        unsafe { *self.0.as_ptr() }
    }

    /// Overwrite the word stored at this slot.
    pub fn write(self, value: TaggedWord) {
        // SAFETY: see read.
        unsafe { *self.0.as_ptr() = value };
    }
}

// ============================================================================
// Slot kinds for typed remembered-set entries
// ============================================================================

/// How a recorded slot encodes its pointer. Untyped entries are implicitly
/// `Tagged`; typed entries carry the kind so fix-up can rewrite non-uniform
/// encodings (e.g. raw addresses embedded in `Mixed` payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotKind {
    /// An ordinary tagged word.
    Tagged = 0,
    /// A raw, untagged object address.
    RawAddress = 1,
}

// ============================================================================
// Scan dispatch
// ============================================================================

/// Callback receiving each pointer slot of a scanned object.
pub trait SlotVisitor {
    /// Called for every visited slot currently holding a pointer.
    fn visit_slot(&mut self, slot: SlotAddr, value: ObjRef);
}

type ScanFn = fn(ObjRef, &mut dyn SlotVisitor);

fn visit_range(obj: ObjRef, from: usize, to: usize, visitor: &mut dyn SlotVisitor) {
    for i in from..to {
        let slot = obj.slot(i);
        if let Some(target) = slot.read().as_object() {
            visitor.visit_slot(slot, target);
        }
    }
}

fn scan_all_fields(obj: ObjRef, visitor: &mut dyn SlotVisitor) {
    visit_range(obj, 0, obj.field_count(), visitor);
}

fn scan_tagged_suffix(obj: ObjRef, visitor: &mut dyn SlotVisitor) {
    visit_range(obj, obj.raw_words(), obj.field_count(), visitor);
}

fn scan_nothing(_obj: ObjRef, _visitor: &mut dyn SlotVisitor) {}

fn scan_weak_cell_slots(obj: ObjRef, visitor: &mut dyn SlotVisitor) {
    visit_range(obj, WEAK_CELL_TARGET, WEAK_CELL_TARGET + 1, visitor);
}

/// Per-kind scan strategies, built once at heap initialization.
///
/// `strong` drives marking: it visits only slots that keep their target
/// alive. `all_pointers` drives relocation bookkeeping: it visits every slot
/// that can hold an address, weak links included, because a moved target
/// must be fixed up no matter how weakly it is referenced.
pub struct ScanTable {
    strong: [ScanFn; KIND_COUNT],
    all_pointers: [ScanFn; KIND_COUNT],
}

impl ScanTable {
    /// Build the dispatch table.
    #[must_use]
    pub fn new() -> Self {
        let mut strong: [ScanFn; KIND_COUNT] = [scan_nothing; KIND_COUNT];
        let mut all_pointers: [ScanFn; KIND_COUNT] = [scan_nothing; KIND_COUNT];

        strong[ObjectKind::Plain as usize] = scan_all_fields;
        strong[ObjectKind::Mixed as usize] = scan_tagged_suffix;
        strong[ObjectKind::ProgressBar as usize] = scan_all_fields;
        // Ephemeron keys/values, weak-cell targets and shape links are
        // handled by dedicated phases, not by strong tracing.

        all_pointers[ObjectKind::Plain as usize] = scan_all_fields;
        all_pointers[ObjectKind::Mixed as usize] = scan_tagged_suffix;
        all_pointers[ObjectKind::ProgressBar as usize] = scan_all_fields;
        all_pointers[ObjectKind::Ephemeron as usize] = scan_all_fields;
        all_pointers[ObjectKind::WeakCell as usize] = scan_weak_cell_slots;
        all_pointers[ObjectKind::Shape as usize] = scan_all_fields;

        Self { strong, all_pointers }
    }

    /// Visit the slots that keep their targets alive.
    pub fn scan_strong(&self, obj: ObjRef, visitor: &mut dyn SlotVisitor) {
        self.strong[obj.kind() as usize](obj, visitor);
    }

    /// Visit every pointer-bearing slot, weak links included.
    pub fn scan_all_pointers(&self, obj: ObjRef, visitor: &mut dyn SlotVisitor) {
        self.all_pointers[obj.kind() as usize](obj, visitor);
    }
}

impl Default for ScanTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_word_roundtrip() {
        let imm = TaggedWord::from_immediate(42);
        assert!(!imm.is_pointer());
        assert_eq!(imm.immediate(), 42);
        assert!(imm.as_object().is_none());
    }

    #[test]
    fn test_tagged_null_is_immediate() {
        assert!(!TaggedWord::NULL.is_pointer());
        assert_eq!(TaggedWord::NULL.immediate(), 0);
    }

    #[test]
    fn test_kind_tag_roundtrip() {
        for v in 0..KIND_COUNT as u8 {
            let kind = ObjectKind::from_u8(v).unwrap();
            assert_eq!(kind as u8, v);
        }
        assert!(ObjectKind::from_u8(KIND_COUNT as u8).is_none());
    }

    #[test]
    fn test_header_is_two_words() {
        assert_eq!(HEADER_SIZE, 2 * WORD_SIZE);
    }
}
