//! Ordered sequences of element references.

use std::rc::{Rc, Weak};

use crate::element::{Element, ElementHandle};
use crate::error::Error;

/// An array of (possibly null) element references.
///
/// Carries a back-pointer to the [`Element`] that owns it, not directly to
/// a datamodel (spec §3): ownership of its entries is checked against the
/// owning element's datamodel. An array with no owner yet is "detached"
/// and may be freely mutated; once attached to an attribute it may not be
/// re-parented (spec §4.3).
#[derive(Clone, Debug, Default)]
pub struct ElementArray {
    pub(crate) owner: Weak<std::cell::RefCell<Element>>,
    pub(crate) items: Vec<Option<ElementHandle>>,
}

impl ElementArray {
    pub fn new() -> Self {
        Self { owner: Weak::new(), items: Vec::new() }
    }

    pub fn from_vec(items: Vec<Option<ElementHandle>>) -> Self {
        Self { owner: Weak::new(), items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Option<ElementHandle>> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Option<ElementHandle>> {
        self.items.iter()
    }

    /// `true` once this array has been attached to an owning element.
    pub fn is_attached(&self) -> bool {
        self.owner.upgrade().is_some()
    }

    pub(crate) fn owner_datamodel(&self) -> Option<crate::element::DatamodelWeak> {
        self.owner.upgrade().map(|owner| owner.borrow().owner())
    }

    /// Attaches this (previously detached) array to `owner`. Fails with
    /// [`Error::InvalidOperation`] if it is already attached elsewhere
    /// (spec §4.3).
    pub(crate) fn attach(&mut self, owner: &Rc<std::cell::RefCell<Element>>) -> Result<(), Error> {
        if let Some(existing) = self.owner.upgrade() {
            if !Rc::ptr_eq(&existing, owner) {
                return Err(Error::InvalidOperation("element array is already attached to another element".into()));
            }
            return Ok(());
        }
        self.owner = Rc::downgrade(owner);
        Ok(())
    }

    /// Validates that `element` may be inserted: null, a stub, or owned by
    /// the same datamodel as the array's owning element (spec §4.3).
    fn check_ownership(&self, element: &Option<ElementHandle>) -> Result<(), Error> {
        let Some(handle) = element else { return Ok(()) };
        let element_ref = handle.borrow();
        if element_ref.is_stub() {
            return Ok(());
        }
        let Some(array_datamodel) = self.owner_datamodel() else {
            return Ok(());
        };
        match element_ref.owner().upgrade() {
            Some(element_datamodel) => {
                let array_dm = array_datamodel.upgrade();
                match array_dm {
                    Some(array_dm) if Rc::ptr_eq(&array_dm, &element_datamodel) => Ok(()),
                    _ => Err(Error::ElementOwnership { id: element_ref.id() }),
                }
            }
            None => Ok(()),
        }
    }

    pub fn push(&mut self, element: Option<ElementHandle>) -> Result<(), Error> {
        self.check_ownership(&element)?;
        self.items.push(element);
        Ok(())
    }

    pub fn insert(&mut self, index: usize, element: Option<ElementHandle>) -> Result<(), Error> {
        self.check_ownership(&element)?;
        self.items.insert(index, element);
        Ok(())
    }

    pub fn set(&mut self, index: usize, element: Option<ElementHandle>) -> Result<(), Error> {
        self.check_ownership(&element)?;
        self.items[index] = element;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
