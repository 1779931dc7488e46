//! Intrusive doubly linked list whose elements live in an external pool
//! (e.g., a `Slab`) and are identified by their index in the pool.
//!
//! The list doesn't own its elements. Each element embeds an
//! `Option<`[`Link`]`>`, which is `Some(_)` if and only if the element is
//! currently in a list.
use core::ops;

/// Linked list header.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub(crate) first: Option<usize>,
    pub(crate) last: Option<usize>,
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

/// Implemented by pool elements that embed a [`Link`].
pub(crate) trait Linked {
    fn link(&self) -> Option<Link>;
    fn link_mut(&mut self) -> &mut Option<Link>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemError {
    NotLinked,
}

impl ListHead {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            last: None,
        }
    }

    pub(crate) fn front(&self) -> Option<usize> {
        self.first
    }

    /// Iterate over the elements of the list from front to back.
    pub(crate) fn iter<'a, Pool: ?Sized>(&self, pool: &'a Pool) -> Iter<'a, Pool> {
        Iter {
            pool,
            next: self.first,
        }
    }
}

/// Get the element following `item`. Returns `None` if `item` is the last
/// element or isn't linked.
#[inline]
pub(crate) fn next<Pool, Element>(pool: &Pool, item: usize) -> Option<usize>
where
    Pool: ops::Index<usize, Output = Element> + ?Sized,
    Element: Linked,
{
    pool[item].link().and_then(|link| link.next)
}

/// Mutable accessor to a linked list.
pub(crate) struct ListAccessor<'a, Pool: ?Sized> {
    head: &'a mut ListHead,
    pool: &'a mut Pool,
}

impl<'a, Pool, Element> ListAccessor<'a, Pool>
where
    Pool: ops::IndexMut<usize, Output = Element> + ?Sized,
    Element: Linked + 'a,
{
    pub(crate) fn new(head: &'a mut ListHead, pool: &'a mut Pool) -> Self {
        Self { head, pool }
    }

    pub(crate) fn front(&self) -> Option<usize> {
        self.head.front()
    }

    pub(crate) fn next(&self, item: usize) -> Option<usize> {
        next(&*self.pool, item)
    }

    pub(crate) fn is_linked(&self, item: usize) -> bool {
        self.pool[item].link().is_some()
    }

    pub(crate) fn pool(&self) -> &Pool {
        &*self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut Pool {
        &mut *self.pool
    }

    /// Get a mutable reference to the link of an element that is known to be
    /// in the list.
    fn link_of(&mut self, item: usize) -> &mut Link {
        match self.pool[item].link_mut() {
            Some(link) => link,
            None => panic!("linked list is inconsistent"),
        }
    }

    /// Insert `item` before the position `at` (if `at` is `Some(_)`) or to
    /// the list's back (if `at` is `None`).
    ///
    /// Panics if `item` is already linked or `at` is not linked.
    pub(crate) fn insert(&mut self, item: usize, at: Option<usize>) {
        assert!(!self.is_linked(item), "item is already linked");

        let (prev, next) = match at {
            Some(at) => match self.pool[at].link() {
                Some(at_link) => (at_link.prev, Some(at)),
                None => panic!("insertion point is not linked"),
            },
            None => (self.head.last, None),
        };

        *self.pool[item].link_mut() = Some(Link { prev, next });

        // prev.next = item
        match prev {
            Some(prev) => self.link_of(prev).next = Some(item),
            None => self.head.first = Some(item),
        }

        // next.prev = item
        match next {
            Some(next) => self.link_of(next).prev = Some(item),
            None => self.head.last = Some(item),
        }
    }

    /// Remove `item` from the list. Returns `item`.
    pub(crate) fn remove(&mut self, item: usize) -> Result<usize, ItemError> {
        let link = self.pool[item].link().ok_or(ItemError::NotLinked)?;

        // link.prev.next = link.next
        match link.prev {
            Some(prev) => self.link_of(prev).next = link.next,
            None => self.head.first = link.next,
        }

        // link.next.prev = link.prev
        match link.next {
            Some(next) => self.link_of(next).prev = link.prev,
            None => self.head.last = link.prev,
        }

        *self.pool[item].link_mut() = None;

        Ok(item)
    }

    #[inline]
    pub(crate) fn pop_front(&mut self) -> Option<usize> {
        let first = self.front()?;
        self.remove(first).ok()
    }
}

/// An iterator over the elements of a list. Yields each element's index and
/// a reference to it.
pub(crate) struct Iter<'a, Pool: ?Sized> {
    pool: &'a Pool,
    next: Option<usize>,
}

impl<'a, Pool, Element> Iterator for Iter<'a, Pool>
where
    Pool: ops::Index<usize, Output = Element> + ?Sized,
    Element: Linked + 'a,
{
    type Item = (usize, &'a Element);

    fn next(&mut self) -> Option<Self::Item> {
        let pool: &'a Pool = self.pool;
        let item = self.next?;
        let element = &pool[item];
        self.next = element.link().and_then(|link| link.next);
        Some((item, element))
    }
}
