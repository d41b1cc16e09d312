//! An intrusive, balanced ordered set of timers.
//!
//! A [`TimerQueue`] is an AVL tree whose nodes are the queued elements
//! themselves: the child pointers, subtree height and ordering key live in a
//! [`Links`] struct embedded in each element, in the same manner as the
//! [`cordyceps`] collections. Inserting and removing elements never allocates.
//!
//! Elements are ordered by their expiry instant. Ties are broken by insertion
//! order, so that timers with the same expiry fire in the order they were
//! queued. The queue caches a pointer to its minimum element, so that the next
//! timer to expire can be found in constant time.
use crate::time::Instant;
use cordyceps::Linked;
use core::{cmp, fmt, marker::PhantomPinned, ptr::NonNull};


/// An intrusive AVL tree ordered by expiry.
pub struct TimerQueue<T: Linked<Links<T>> + ?Sized> {
    root: Link<T>,
    /// The leftmost node, cached so the next expiry can be found without
    /// descending the tree.
    first: Link<T>,
    len: usize,
    /// Sequence number handed to the next inserted node, used to break ties
    /// between equal expiries.
    next_seq: u64,
}

/// Links and ordering key embedded in a [`TimerQueue`] element.
pub struct Links<T: ?Sized> {
    left: Link<T>,
    right: Link<T>,
    height: u8,
    key: Key,
    linked: bool,
    /// Linked list links must always be `!Unpin`, in order to ensure that they
    /// never receive LLVM `noalias` annotations; see also
    /// <https://github.com/rust-lang/rust/issues/63818>.
    _unpin: PhantomPinned,
}

/// The position of a node in a [`TimerQueue`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Key {
    expires: Instant,
    seq: u64,
}

type Link<T> = Option<NonNull<T>>;

// === impl TimerQueue ===

impl<T: Linked<Links<T>> + ?Sized> TimerQueue<T> {
    /// Returns a new, empty `TimerQueue`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: None,
            first: None,
            len: 0,
            next_seq: 0,
        }
    }

    /// Returns the number of elements in the queue.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.root.is_none(), self.first.is_none());
        self.first.is_none()
    }

    /// Returns a pointer to the element with the earliest expiry, without
    /// removing it.
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<NonNull<T>> {
        self.first
    }

    /// Returns the expiry of the earliest element, if there is one.
    #[must_use]
    pub fn first_expires(&self) -> Option<Instant> {
        // Safety: `first` is always a node in this tree, which is valid while
        // it is linked.
        self.first.map(|first| unsafe { links(first).key.expires })
    }

    /// Inserts `item` into the queue, ordered by `expires`.
    ///
    /// Returns `true` if `item` is now the queue's earliest element.
    ///
    /// # Panics
    ///
    /// If `item` is already linked into a queue.
    pub fn insert(&mut self, item: T::Handle, expires: Instant) -> bool {
        let ptr = T::into_ptr(item);
        let key = Key {
            expires,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);

        unsafe {
            // Safety: we own the handle, so the pointer is valid, and the
            // element is not linked into any other tree.
            let node = links(ptr);
            assert!(!node.linked, "cannot insert an element that is already queued");
            node.left = None;
            node.right = None;
            node.height = 1;
            node.key = key;
            node.linked = true;

            self.root = Some(Self::insert_at(self.root, ptr, &key));
        }
        self.len += 1;

        let is_first = match self.first {
            // Safety: `first` is linked into this tree.
            Some(first) => key < unsafe { links(first).key },
            None => true,
        };
        if is_first {
            self.first = Some(ptr);
        }
        is_first
    }

    /// Removes an arbitrary element from the queue.
    ///
    /// Returns [`None`] if `item` was not linked.
    ///
    /// # Safety
    ///
    /// If `item` is linked, it must be linked into *this* queue.
    pub unsafe fn remove(&mut self, item: NonNull<T>) -> Option<T::Handle> {
        let key = {
            let node = links(item);
            if !node.linked {
                return None;
            }
            node.key
        };

        let (root, removed) = Self::remove_at(self.root, &key);
        debug_assert_eq!(removed, Some(item), "removed the wrong node");
        let removed = removed?;
        self.root = root;
        self.len -= 1;

        let node = links(removed);
        node.left = None;
        node.right = None;
        node.height = 0;
        node.linked = false;

        if self.first == Some(removed) {
            self.first = self.root.map(|root| Self::leftmost(root));
        }

        Some(T::from_ptr(removed))
    }

    /// Returns the element that follows `node` in expiry order.
    ///
    /// # Safety
    ///
    /// `node` must be linked into *this* queue.
    #[must_use]
    pub unsafe fn next(&self, node: NonNull<T>) -> Option<NonNull<T>> {
        let key = links(node).key;
        let mut cur = self.root;
        let mut next = None;
        while let Some(n) = cur {
            if key < links(n).key {
                next = Some(n);
                cur = links(n).left;
            } else {
                cur = links(n).right;
            }
        }
        next
    }

    /// Removes and returns the element with the earliest expiry.
    pub fn pop_first(&mut self) -> Option<T::Handle> {
        let first = self.first?;
        // Safety: `first` is linked into this tree.
        unsafe { self.remove(first) }
    }

    /// Calls `f` with each element of the queue, in expiry order.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        unsafe fn visit<T: Linked<Links<T>> + ?Sized>(node: Link<T>, f: &mut impl FnMut(&T)) {
            if let Some(node) = node {
                visit(links(node).left, f);
                f(node.as_ref());
                visit(links(node).right, f);
            }
        }
        // Safety: every node reachable from the root is linked and valid.
        unsafe { visit(self.root, &mut f) }
    }

    /// Asserts that the tree's ordering, balance, length and cached minimum
    /// invariants hold.
    ///
    /// # Panics
    ///
    /// If any invariant is violated.
    #[track_caller]
    pub fn assert_valid(&self) {
        struct Subtree {
            height: u8,
            len: usize,
            min: Key,
            max: Key,
        }

        #[track_caller]
        unsafe fn check<T: Linked<Links<T>> + ?Sized>(node: NonNull<T>) -> Subtree {
            let (left, right, height, key, linked) = {
                let l = links(node);
                (l.left, l.right, l.height, l.key, l.linked)
            };
            assert!(linked, "node {node:p} in tree is not marked as linked");
            let left = left.map(|left| check(left));
            let right = right.map(|right| check(right));
            let (lh, rh) = (
                left.as_ref().map_or(0, |s| s.height),
                right.as_ref().map_or(0, |s| s.height),
            );
            assert_eq!(height, cmp::max(lh, rh) + 1, "stale height at {node:p}");
            assert!(lh.abs_diff(rh) <= 1, "node {node:p} is unbalanced ({lh} vs {rh})");
            if let Some(ref left) = left {
                assert!(left.max < key, "left subtree of {node:p} is out of order");
            }
            if let Some(ref right) = right {
                assert!(right.min > key, "right subtree of {node:p} is out of order");
            }
            Subtree {
                height,
                len: 1 + left.as_ref().map_or(0, |s| s.len) + right.as_ref().map_or(0, |s| s.len),
                min: left.as_ref().map_or(key, |s| s.min),
                max: right.as_ref().map_or(key, |s| s.max),
            }
        }

        let Some(root) = self.root else {
            assert!(self.first.is_none(), "empty queue has a cached first element");
            assert_eq!(self.len, 0, "empty queue has a non-zero length");
            return;
        };
        unsafe {
            let tree = check(root);
            assert_eq!(tree.len, self.len, "queue length is wrong");
            let leftmost = Self::leftmost(root);
            assert_eq!(self.first, Some(leftmost), "cached first element is not the minimum");
            assert_eq!(links(leftmost).key, tree.min);
        }
    }

    unsafe fn insert_at(root: Link<T>, node: NonNull<T>, key: &Key) -> NonNull<T> {
        let Some(root) = root else {
            return node;
        };
        if *key < links(root).key {
            let left = Self::insert_at(links(root).left, node, key);
            links(root).left = Some(left);
        } else {
            let right = Self::insert_at(links(root).right, node, key);
            links(root).right = Some(right);
        }
        Self::rebalance(root)
    }

    /// Removes the node with `key` from the subtree rooted at `root`,
    /// returning the new subtree root and the removed node.
    unsafe fn remove_at(root: Link<T>, key: &Key) -> (Link<T>, Link<T>) {
        let Some(node) = root else {
            return (None, None);
        };
        match key.cmp(&links(node).key) {
            cmp::Ordering::Less => {
                let (left, removed) = Self::remove_at(links(node).left, key);
                links(node).left = left;
                (Some(Self::rebalance(node)), removed)
            }
            cmp::Ordering::Greater => {
                let (right, removed) = Self::remove_at(links(node).right, key);
                links(node).right = right;
                (Some(Self::rebalance(node)), removed)
            }
            cmp::Ordering::Equal => {
                let (left, right) = (links(node).left, links(node).right);
                let Some(right) = right else {
                    return (left, Some(node));
                };
                // Replace the removed node with its in-order successor.
                let (right, successor) = Self::remove_min(right);
                let succ = links(successor);
                succ.left = left;
                succ.right = right;
                (Some(Self::rebalance(successor)), Some(node))
            }
        }
    }

    unsafe fn remove_min(node: NonNull<T>) -> (Link<T>, NonNull<T>) {
        match links(node).left {
            None => (links(node).right, node),
            Some(left) => {
                let (left, min) = Self::remove_min(left);
                links(node).left = left;
                (Some(Self::rebalance(node)), min)
            }
        }
    }

    unsafe fn leftmost(mut node: NonNull<T>) -> NonNull<T> {
        while let Some(left) = links(node).left {
            node = left;
        }
        node
    }

    unsafe fn rebalance(node: NonNull<T>) -> NonNull<T> {
        Self::update_height(node);
        let (left, right) = (links(node).left, links(node).right);
        let balance = i16::from(height(left)) - i16::from(height(right));
        match (balance, left, right) {
            (2, Some(left), _) => {
                if height(links(left).left) < height(links(left).right) {
                    links(node).left = Some(Self::rotate_left(left));
                }
                Self::rotate_right(node)
            }
            (-2, _, Some(right)) => {
                if height(links(right).right) < height(links(right).left) {
                    links(node).right = Some(Self::rotate_right(right));
                }
                Self::rotate_left(node)
            }
            _ => {
                debug_assert!(balance.abs() <= 1, "tree was unbalanced by {balance}");
                node
            }
        }
    }

    unsafe fn rotate_right(node: NonNull<T>) -> NonNull<T> {
        let Some(left) = links(node).left else {
            unreachable!("rotate_right requires a left child")
        };
        links(node).left = links(left).right;
        links(left).right = Some(node);
        Self::update_height(node);
        Self::update_height(left);
        left
    }

    unsafe fn rotate_left(node: NonNull<T>) -> NonNull<T> {
        let Some(right) = links(node).right else {
            unreachable!("rotate_left requires a right child")
        };
        links(node).right = links(right).left;
        links(right).left = Some(node);
        Self::update_height(node);
        Self::update_height(right);
        right
    }

    unsafe fn update_height(node: NonNull<T>) {
        let (left, right) = (links(node).left, links(node).right);
        links(node).height = cmp::max(height(left), height(right)) + 1;
    }
}

impl<T: Linked<Links<T>> + ?Sized> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked<Links<T>> + ?Sized> fmt::Debug for TimerQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("root", &self.root)
            .field("first", &self.first)
            .field("len", &self.len)
            .finish()
    }
}

// === impl Links ===

impl<T: ?Sized> Links<T> {
    /// Returns new, unlinked links.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            left: None,
            right: None,
            height: 0,
            key: Key {
                expires: Instant::ZERO,
                seq: 0,
            },
            linked: false,
            _unpin: PhantomPinned,
        }
    }

    /// Returns `true` if this node is currently in a queue.
    #[inline]
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Returns the expiry this node was queued with.
    #[inline]
    #[must_use]
    pub fn expires(&self) -> Instant {
        self.key.expires
    }
}

impl<T: ?Sized> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("height", &self.height)
            .field("key", &self.key)
            .field("linked", &self.linked)
            .finish()
    }
}

// === impl Key ===

impl Key {
    /// Returns the expiry component of this key.
    #[must_use]
    pub fn expires(&self) -> Instant {
        self.expires
    }
}

#[inline]
unsafe fn links<'a, T: Linked<Links<T>> + ?Sized>(ptr: NonNull<T>) -> &'a mut Links<T> {
    &mut *T::links(ptr).as_ptr()
}

#[inline]
unsafe fn height<T: Linked<Links<T>> + ?Sized>(node: Link<T>) -> u8 {
    node.map_or(0, |node| links(node).height)
}
