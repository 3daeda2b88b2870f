//! Intrusive doubly-linked lists threaded through nodes resident in raw
//! buddy-granted memory.
//!
//! The list never owns its nodes; it only splices the [`Links`] embedded in
//! them. Nodes are addressed by raw [`NonNull`] pointers because their
//! storage outlives any borrow we could name, so every link operation is
//! `unsafe` and relies on the caller holding the lock that guards the list.

use core::ptr::NonNull;

/// Prev/next pointers embedded in a list node.
pub(crate) struct Links<T> {
    next: Option<NonNull<T>>,
    prev: Option<NonNull<T>>,
}

impl<T> Links<T> {
    pub(crate) const fn new() -> Links<T> {
        Links { next: None, prev: None }
    }
}

/// A node type carrying embedded [`Links`].
pub(crate) trait Linked: Sized {
    /// Returns the location of `node`'s embedded links.
    ///
    /// # Safety
    ///
    /// `node` must point to a live, initialized node.
    unsafe fn links(node: NonNull<Self>) -> *mut Links<Self>;
}

/// A doubly-linked list of `T` nodes, tracked by head pointer and length.
pub(crate) struct RawList<T: Linked> {
    head: Option<NonNull<T>>,
    len: usize,
}

impl<T: Linked> RawList<T> {
    pub(crate) const fn new() -> RawList<T> {
        RawList { head: None, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn front(&self) -> Option<NonNull<T>> {
        self.head
    }

    /// Links `node` in at the front.
    ///
    /// # Safety
    ///
    /// `node` must be live and not currently on any list.
    pub(crate) unsafe fn push_front(&mut self, node: NonNull<T>) {
        let links = T::links(node);
        (*links).prev = None;
        (*links).next = self.head;
        if let Some(head) = self.head {
            (*T::links(head)).prev = Some(node);
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// Unlinks and returns the front node, if any.
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<T>> {
        let node = self.head?;
        // SAFETY: list members are live by the list invariant.
        unsafe {
            self.head = (*T::links(node)).next;
            if let Some(next) = self.head {
                (*T::links(next)).prev = None;
            }
            (*T::links(node)).next = None;
        }
        self.len -= 1;
        Some(node)
    }

    /// Unlinks `node` from its position in this list.
    ///
    /// # Safety
    ///
    /// `node` must be a member of this list.
    pub(crate) unsafe fn remove(&mut self, node: NonNull<T>) {
        let links = T::links(node);
        match (*links).prev {
            Some(prev) => (*T::links(prev)).next = (*links).next,
            None => self.head = (*links).next,
        }
        if let Some(next) = (*links).next {
            (*T::links(next)).prev = (*links).prev;
        }
        (*links).next = None;
        (*links).prev = None;
        self.len -= 1;
    }

    /// Whether `node` is currently a member of this list.
    pub(crate) fn contains(&self, node: NonNull<T>) -> bool {
        self.iter().any(|member| member == node)
    }

    pub(crate) fn iter(&self) -> Iter<T> {
        Iter { cursor: self.head }
    }
}

pub(crate) struct Iter<T: Linked> {
    cursor: Option<NonNull<T>>,
}

impl<T: Linked> Iterator for Iter<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let node = self.cursor?;
        // SAFETY: list members are live by the list invariant.
        self.cursor = unsafe { (*T::links(node)).next };
        Some(node)
    }
}
