//! Marking primitives shared by the barrier, the controller and the
//! collector: color lookup through page headers plus grey/black transitions
//! wired to the worklist.

pub mod bitmap;

pub use bitmap::{Color, ColorBitmap};

use crate::gc::worklist::MarkingDeque;
use crate::heap::{page_of, PagePtr};
use crate::object::ObjRef;

/// Page and slot index of an object.
#[must_use]
pub fn locate(obj: ObjRef) -> (PagePtr, usize) {
    let page = page_of(obj);
    let index = page
        .header()
        .index_of(obj.addr())
        .expect("object address is not a slot start");
    (page, index)
}

/// Current color of an object.
#[must_use]
pub fn color_of(obj: ObjRef) -> Color {
    let (page, index) = locate(obj);
    page.header().colors.color(index)
}

/// Unconditionally recolor an object.
pub fn set_color_of(obj: ObjRef, color: Color) {
    let (page, index) = locate(obj);
    page.header().colors.set_color(index, color);
}

/// White → grey; list the object on the deque when the transition happened.
///
/// A full deque leaves the object grey but unlisted, relying on the
/// overflow/refill protocol.
pub fn mark_grey_and_push(deque: &MarkingDeque, obj: ObjRef) -> bool {
    let (page, index) = locate(obj);
    if page.header().colors.mark_grey(index) {
        deque.push(obj);
        true
    } else {
        false
    }
}

/// Demote a black object to grey and relist it for re-scanning.
pub fn regrey_and_push(deque: &MarkingDeque, obj: ObjRef) {
    let (page, index) = locate(obj);
    page.header().colors.set_color(index, Color::Grey);
    deque.push(obj);
}

/// Any → black. Returns whether this call blackened the object.
pub fn blacken(obj: ObjRef) -> bool {
    let (page, index) = locate(obj);
    page.header().colors.mark_black(index)
}

/// Carry an object's color to its relocated copy, whitening the source.
pub fn transfer_color(from: ObjRef, to: ObjRef) {
    let (from_page, from_index) = locate(from);
    let (to_page, to_index) = locate(to);
    from_page
        .header()
        .colors
        .transfer_to(from_index, &to_page.header().colors, to_index);
}
