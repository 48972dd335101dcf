//! Named, typed, possibly-deferred values attached to an [`crate::Element`].

use std::fmt;
use std::rc::{Rc, Weak};

use uuid::Uuid;

use crate::codec::Codec;
use crate::element::{DatamodelWeak, Element, ElementHandle};
use crate::element_array::ElementArray;
use crate::error::Error;
use crate::value::Value;

/// Either the value is in hand, or we know where to find it in the source
/// stream but haven't decoded it yet.
#[derive(Clone)]
enum State {
    Materialized(Value),
    Deferred { offset: u64, codec: Rc<dyn Codec> },
}

/// A named value on an [`Element`].
///
/// `owner` is a non-owning back-pointer to the element holding this
/// attribute, used to climb `attribute -> element -> datamodel -> codec`
/// when resolving a deferred load or a stub reference.
pub struct Attribute {
    name: String,
    pub(crate) owner: Weak<std::cell::RefCell<Element>>,
    state: State,
}

impl Clone for Attribute {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), owner: self.owner.clone(), state: self.state.clone() }
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Attribute");
        s.field("name", &self.name);
        match &self.state {
            State::Materialized(value) => s.field("value", value),
            State::Deferred { offset, .. } => s.field("deferred_offset", offset),
        };
        s.finish_non_exhaustive()
    }
}

impl Attribute {
    pub(crate) fn new(name: impl Into<String>, value: Value) -> Self {
        Self { name: name.into(), owner: Weak::new(), state: State::Materialized(value) }
    }

    pub(crate) fn new_deferred(name: impl Into<String>, offset: u64, codec: Rc<dyn Codec>) -> Self {
        Self { name: name.into(), owner: Weak::new(), state: State::Deferred { offset, codec } }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.state, State::Deferred { .. })
    }

    /// The pending offset, if this attribute hasn't been materialized yet.
    /// Zero once [`Attribute::deferred_load`] has succeeded (spec §8
    /// invariant 5).
    pub fn pending_offset(&self) -> u64 {
        match &self.state {
            State::Deferred { offset, .. } => *offset,
            State::Materialized(_) => 0,
        }
    }

    fn owner_chain(&self) -> Option<(ElementHandle, DatamodelWeak)> {
        let element = self.owner.upgrade()?;
        let datamodel = element.borrow().owner();
        Some((element, datamodel))
    }

    /// Resolves a deferred attribute against its bound codec, given the
    /// owning element's id (used only to name it in a [`Error::Codec`]).
    /// One-way: once materialized an attribute never goes back to deferred
    /// (spec §4.2 state machine). Fails with [`Error::InvalidOperation`] if
    /// the attribute is already materialized.
    ///
    /// Takes `owner_id` as a parameter rather than deriving it by
    /// upgrading and borrowing `self.owner`'s element, so this is safe to
    /// call while that element's `RefCell` is already borrowed (e.g. from
    /// [`Element::get_attribute`]) — re-borrowing it here would panic.
    pub(crate) fn deferred_load_for(&mut self, owner_id: Uuid) -> Result<(), Error> {
        let (offset, codec) = match &self.state {
            State::Deferred { offset, codec } => (*offset, codec.clone()),
            State::Materialized(_) => return Err(Error::InvalidOperation(format!("attribute \"{}\" is not deferred", self.name))),
        };

        let value = codec.deferred_decode_attribute(offset).map_err(|source| Error::Codec {
            attribute: self.name.clone(),
            owner: owner_id,
            codec: codec.identity(),
            source,
        })?;

        self.state = State::Materialized(value);
        Ok(())
    }

    /// Convenience for an attribute not reached through its owning
    /// element's map — a detached copy, or one not yet inserted — which
    /// derives the owner id from `self.owner` itself. Do not call this on
    /// the `&mut Attribute` returned by [`Element::attribute_mut`] while
    /// the element's borrow is still live: it re-borrows that same owner
    /// and panics. [`Element::get_attribute`] is the safe path for that.
    pub fn deferred_load(&mut self) -> Result<(), Error> {
        let owner_id = self.owner.upgrade().map(|e| e.borrow().id()).unwrap_or_default();
        self.deferred_load_for(owner_id)
    }

    /// Validates and stores `value`, adopting any detached element(s) it
    /// carries into the attribute owner's datamodel (attaching a detached
    /// [`ElementArray`] to the owning element first), and clears any
    /// pending deferred offset (spec §4.2 `set`).
    pub fn set(&mut self, mut value: Value) -> Result<(), Error> {
        if let Some((element, datamodel)) = self.owner_chain() {
            adopt_value(&mut value, &element, &datamodel)?;
        }
        self.state = State::Materialized(value);
        Ok(())
    }

    /// Resolves deferred state and stub references given the owning
    /// element's id and datamodel directly, without re-deriving them by
    /// upgrading and borrowing `self.owner`'s element — safe to call while
    /// the caller already holds that element's `RefMut` (spec §4.2 `get`).
    /// Substitution happens in place, so a later read through the same
    /// storage observes the resolved element directly.
    pub(crate) fn get_for(&mut self, owner_id: Uuid, datamodel: &DatamodelWeak) -> Result<Value, Error> {
        if self.is_deferred() {
            self.deferred_load_for(owner_id)?;
        }

        if let State::Materialized(value) = &mut self.state {
            resolve_stubs(value, datamodel);
            Ok(value.clone())
        } else {
            unreachable!("deferred_load_for always materializes or returns early")
        }
    }

    /// Returns the current value, first resolving a deferred load and then
    /// substituting any stub element reference the datamodel's stub
    /// resolver can now satisfy (spec §4.2 `get`). Convenience for a
    /// detached/cloned attribute; see the note on [`Attribute::deferred_load`]
    /// about re-borrowing — [`Element::get_attribute`] is the safe in-place
    /// path when mutating the attribute stored in an element's map.
    pub fn get(&mut self) -> Result<Value, Error> {
        match self.owner_chain() {
            Some((element, datamodel)) => {
                let owner_id = element.borrow().id();
                self.get_for(owner_id, &datamodel)
            }
            None => self.get_for(Uuid::nil(), &Weak::new()),
        }
    }

    /// Reassigns the owning element. Spec §4.2: reassigning owner to a
    /// *different* element eagerly resolves any pending deferred load
    /// first, since the offset is only meaningful against the original
    /// codec/stream.
    pub(crate) fn reparent(&mut self, new_owner: &Rc<std::cell::RefCell<Element>>) -> Result<(), Error> {
        if self.is_deferred() {
            self.deferred_load()?;
        }
        self.owner = Rc::downgrade(new_owner);
        Ok(())
    }
}

fn adopt_value(value: &mut Value, owner: &ElementHandle, datamodel: &DatamodelWeak) -> Result<(), Error> {
    match value {
        Value::Element(Some(handle)) => adopt_element(handle, datamodel),
        Value::ElementArray(array) => {
            array.attach(owner)?;
            for item in array.iter().flatten() {
                adopt_element(item, datamodel)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn adopt_element(handle: &ElementHandle, datamodel: &DatamodelWeak) -> Result<(), Error> {
    if handle.borrow().is_stub() {
        return Ok(());
    }
    handle.borrow_mut().adopt(datamodel)
}

fn resolve_stubs(value: &mut Value, datamodel: &DatamodelWeak) {
    match value {
        Value::Element(slot) => resolve_stub_slot(slot, datamodel),
        Value::ElementArray(array) => {
            for slot in array.items.iter_mut() {
                resolve_stub_slot(slot, datamodel);
            }
        }
        _ => {}
    }
}

fn resolve_stub_slot(slot: &mut Option<ElementHandle>, datamodel: &DatamodelWeak) {
    let Some(handle) = slot else { return };
    if !handle.borrow().is_stub() {
        return;
    }
    let id = handle.borrow().id();
    if let Some(datamodel) = datamodel.upgrade() {
        if let Some(resolved) = crate::datamodel::request_stub(&datamodel, id) {
            *slot = Some(resolved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_attribute_is_not_deferred() {
        let attr = Attribute::new("x", Value::Int32(1));
        assert!(!attr.is_deferred());
        assert_eq!(attr.pending_offset(), 0);
    }

    #[test]
    fn get_on_materialized_clones_value() {
        let mut attr = Attribute::new("x", Value::Int32(42));
        let value = attr.get().unwrap();
        assert!(matches!(value, Value::Int32(42)));
    }

    #[test]
    fn deferred_load_on_materialized_attribute_errors() {
        let mut attr = Attribute::new("x", Value::Int32(1));
        assert!(matches!(attr.deferred_load(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn uuid_default_is_nil() {
        assert_eq!(Uuid::default(), Uuid::nil());
    }
}
