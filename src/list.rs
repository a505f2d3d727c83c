//! Doubly linked list with stable node handles.
//!
//! The reactor keeps its sources on lists like this: the element's owner holds
//! a [`Link`] and can detach itself in O(1), including from inside a dispatch
//! callback that is currently iterating the same list. Forward links are
//! strong (`Rc`), backward links are weak, so dropping the list releases every
//! node without a cycle.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

struct Node<T> {
    // `None` once the node has been detached.
    value: Option<T>,
    // Identity of the owning list, checked on removal.
    owner: Weak<()>,
    prev: Option<Weak<RefCell<Node<T>>>>,
    next: Option<Rc<RefCell<Node<T>>>>,
}

/// Handle to one element's position in a [`List`].
///
/// A `Link` does not keep the node alive; once the element is removed (or the
/// list is dropped) the link goes stale and [`List::remove`] on it is a no-op.
pub struct Link<T>(Weak<RefCell<Node<T>>>);

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Link")
            .field(&if self.0.strong_count() > 0 {
                "linked"
            } else {
                "stale"
            })
            .finish()
    }
}

/// Doubly linked list with O(1) insertion and handle-based removal.
pub struct List<T> {
    head: Option<Rc<RefCell<Node<T>>>>,
    tail: Option<Weak<RefCell<Node<T>>>>,
    len: usize,
    id: Rc<()>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("len", &self.len).finish()
    }
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            id: Rc::new(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Inserts `value` at the front of the list.
    pub fn push_front(&mut self, value: T) -> Link<T> {
        let node = Rc::new(RefCell::new(Node {
            value: Some(value),
            owner: Rc::downgrade(&self.id),
            prev: None,
            next: self.head.take(),
        }));
        match &node.borrow().next {
            Some(next) => next.borrow_mut().prev = Some(Rc::downgrade(&node)),
            None => self.tail = Some(Rc::downgrade(&node)),
        }
        let link = Link(Rc::downgrade(&node));
        self.head = Some(node);
        self.len += 1;
        link
    }

    /// Appends `value` at the back of the list.
    pub fn push_back(&mut self, value: T) -> Link<T> {
        let node = Rc::new(RefCell::new(Node {
            value: Some(value),
            owner: Rc::downgrade(&self.id),
            prev: None,
            next: None,
        }));
        let link = Link(Rc::downgrade(&node));
        match self.tail.take().and_then(|weak| weak.upgrade()) {
            Some(tail) => {
                node.borrow_mut().prev = Some(Rc::downgrade(&tail));
                tail.borrow_mut().next = Some(node.clone());
            }
            None => self.head = Some(node.clone()),
        }
        self.tail = Some(Rc::downgrade(&node));
        self.len += 1;
        link
    }

    /// Detaches the element behind `link` and returns it.
    ///
    /// Returns `None` if the link is stale, so removing twice is harmless.
    /// A link produced by a different list is a usage error; in release
    /// builds it is rejected without touching either list.
    pub fn remove(&mut self, link: &Link<T>) -> Option<T> {
        let node = link.0.upgrade()?;
        let owned = Weak::ptr_eq(&node.borrow().owner, &Rc::downgrade(&self.id));
        debug_assert!(owned, "link does not belong to this list");
        if !owned {
            return None;
        }
        let (value, prev, next) = {
            let mut node = node.borrow_mut();
            let value = node.value.take()?;
            (
                value,
                node.prev.take().and_then(|weak| weak.upgrade()),
                node.next.take(),
            )
        };
        match &prev {
            Some(prev) => prev.borrow_mut().next = next.clone(),
            None => self.head = next.clone(),
        }
        match &next {
            Some(next) => next.borrow_mut().prev = prev.as_ref().map(Rc::downgrade),
            None => self.tail = prev.as_ref().map(Rc::downgrade),
        }
        self.len -= 1;
        Some(value)
    }

    /// Detaches and returns the first element.
    pub fn pop_front(&mut self) -> Option<T> {
        let node = self.head.take()?;
        let (value, next) = {
            let mut node = node.borrow_mut();
            (node.value.take(), node.next.take())
        };
        match &next {
            Some(next) => next.borrow_mut().prev = None,
            None => self.tail = None,
        }
        self.head = next;
        self.len -= 1;
        value
    }
}

impl<T: Clone> List<T> {
    /// Iterates in list order.
    ///
    /// The cursor advances past an element before yielding it, so the yielded
    /// element may remove itself from the list without breaking the
    /// traversal. Removing a *later* element ends the traversal early, as with
    /// any linked-list walk; the reactor never does that while iterating.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            cursor: self.head.clone(),
        }
    }
}

/// Iterator over cloned elements of a [`List`].
///
/// Holds no borrow of the list, only node references.
pub struct Iter<T> {
    cursor: Option<Rc<RefCell<Node<T>>>>,
}

impl<T: Clone> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let node = self.cursor.take()?;
        let node = node.borrow();
        self.cursor = node.next.clone();
        node.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_back_order() {
        let mut list = List::new();
        assert!(list.is_empty());
        for i in 1..=4 {
            list.push_back(i);
        }
        assert_eq!(list.len(), 4);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn push_front_order() {
        let mut list = List::new();
        for i in 1..=4 {
            list.push_front(i);
        }
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn remove_middle() {
        let mut list = List::new();
        let _a = list.push_back("a");
        let b = list.push_back("b");
        let _c = list.push_back("c");

        assert_eq!(list.remove(&b), Some("b"));
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["a", "c"]);

        // A second removal through the same link is inert.
        assert_eq!(list.remove(&b), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_ends() {
        let mut list = List::new();
        let a = list.push_back(1);
        let b = list.push_back(2);
        let c = list.push_back(3);

        assert_eq!(list.remove(&a), Some(1));
        assert_eq!(list.remove(&c), Some(3));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(list.remove(&b), Some(2));
        assert!(list.is_empty());
    }

    #[test]
    fn pop_front_drains() {
        let mut list = List::new();
        for i in 0..3 {
            list.push_back(i);
        }
        assert_eq!(list.pop_front(), Some(0));
        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn self_removal_during_iteration() {
        let mut list = List::new();
        let links = (0..4usize)
            .map(|i| (i, list.push_back(i)))
            .collect::<Vec<_>>();

        let mut seen = Vec::new();
        for value in list.iter() {
            seen.push(value);
            // Remove the element we are currently visiting.
            let (_, link) = &links[value];
            assert_eq!(list.remove(link), Some(value));
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "link does not belong to this list")]
    fn cross_list_removal_is_rejected() {
        let mut a = List::new();
        let mut b = List::new();
        a.push_back("a1");
        b.push_back("b1");
        let mid = b.push_back("b2");
        b.push_back("b3");
        a.remove(&mid);
    }

    #[test]
    fn link_stale_after_list_drop() {
        let mut list = List::new();
        let link = list.push_back(7);
        drop(list);

        let mut other = List::new();
        other.push_back(8);
        assert_eq!(other.remove(&link), None);
        assert_eq!(other.len(), 1);
    }
}
