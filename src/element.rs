//! Graph nodes.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::attribute::Attribute;
use crate::datamodel::DatamodelInner;
use crate::error::Error;

/// The shared handle every element reference in the graph actually holds.
///
/// The arena lives in the [`crate::Datamodel`]'s registry; elements refer
/// to each other through these handles (or, once deferred, through a GUID
/// resolved lazily against the registry) rather than through raw ownership
/// pointers, so the graph can be cyclic.
pub type ElementHandle = Rc<RefCell<Element>>;

pub(crate) type DatamodelWeak = Weak<RefCell<DatamodelInner>>;

/// A node in the datamodel graph.
///
/// A stub element carries only an `id`: its `attributes` map is empty and
/// will be supplied by the datamodel's stub resolver on demand (spec §3,
/// "stub").
#[derive(Debug)]
pub struct Element {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) class_name: String,
    pub(crate) stub: bool,
    pub(crate) owner: DatamodelWeak,
    pub(crate) attributes: IndexMap<String, Attribute>,
}

impl Element {
    pub(crate) fn new(id: Uuid, name: impl Into<String>, class_name: impl Into<String>) -> ElementHandle {
        Rc::new(RefCell::new(Self {
            id,
            name: name.into(),
            class_name: class_name.into(),
            stub: false,
            owner: Weak::new(),
            attributes: IndexMap::new(),
        }))
    }

    pub(crate) fn new_stub(id: Uuid, owner: DatamodelWeak) -> ElementHandle {
        Rc::new(RefCell::new(Self {
            id,
            name: String::new(),
            class_name: String::new(),
            stub: true,
            owner,
            attributes: IndexMap::new(),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn set_class_name(&mut self, class_name: impl Into<String>) {
        self.class_name = class_name.into();
    }

    /// A stub element carries only an id; its attributes are absent until a
    /// stub resolver supplies a real element in its place.
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// `true` once this element has been adopted into a datamodel.
    pub fn is_owned(&self) -> bool {
        self.owner.upgrade().is_some()
    }

    pub(crate) fn owner(&self) -> DatamodelWeak {
        self.owner.clone()
    }

    /// One-shot adoption: fails if this element already has a different
    /// owner (spec §4.3 — "permitted only while owner is currently null").
    pub(crate) fn adopt(&mut self, owner: &DatamodelWeak) -> Result<(), Error> {
        if let Some(existing) = self.owner.upgrade() {
            if let Some(new_owner) = owner.upgrade() {
                if !Rc::ptr_eq(&existing, &new_owner) {
                    return Err(Error::ElementOwnership { id: self.id });
                }
                return Ok(());
            }
        }
        self.owner = owner.clone();
        Ok(())
    }

    pub fn reserve_attributes(&mut self, amount: usize) {
        self.attributes.reserve(amount);
    }

    /// Looks up an attribute by name without resolving a deferred load or
    /// stub reference — use [`Element::get_attribute`] to resolve and
    /// persist the current value in place.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.get_mut(name)
    }

    /// Resolves `name`'s value in place (spec §4.2 `get`): deferred-loads
    /// it against its bound codec if necessary and substitutes any
    /// now-resolvable stub reference, writing both back into the stored
    /// attribute so a later, independent read observes the materialized
    /// value directly — without re-triggering the codec (spec §5: reading
    /// a deferred attribute counts as a mutation).
    ///
    /// Unlike calling [`Attribute::get`] on a value cloned out of this
    /// element, this never re-borrows `self` to find its own owner, so it
    /// is the safe accessor to call while `self` is already borrowed
    /// mutably (e.g. via `element_handle.borrow_mut().get_attribute(..)`).
    /// Fails with [`Error::InvalidOperation`] if no attribute named `name`
    /// exists.
    pub fn get_attribute(&mut self, name: &str) -> Result<crate::value::Value, Error> {
        let owner_id = self.id;
        let owner = self.owner.clone();
        let attribute = self.attributes.get_mut(name).ok_or_else(|| Error::InvalidOperation(format!("no such attribute \"{name}\"")))?;
        attribute.get_for(owner_id, &owner)
    }

    /// Typed accessor: resolves `name` like [`Element::get_attribute`],
    /// then converts into `T`. Fails with [`Error::AttributeType`] if the
    /// stored kind doesn't match `T` (spec §4.3 `Get<T>`).
    pub fn get<T>(&mut self, name: &str) -> Result<T, Error>
    where
        T: TryFrom<crate::value::Value, Error = Error>,
    {
        T::try_from(self.get_attribute(name)?)
    }

    /// Typed array accessor: resolves `name` like [`Element::get_attribute`],
    /// then converts into `Vec<T>`. Fails with [`Error::AttributeType`] if
    /// the stored kind isn't the array kind for `T` (spec §4.3
    /// `GetArray<T>`).
    pub fn get_array<T>(&mut self, name: &str) -> Result<Vec<T>, Error>
    where
        Vec<T>: TryFrom<crate::value::Value, Error = Error>,
    {
        Vec::<T>::try_from(self.get_attribute(name)?)
    }

    pub(crate) fn insert_attribute(&mut self, attribute: Attribute) {
        self.attributes.insert(attribute.name().to_string(), attribute);
    }

    /// Attributes in insertion order (spec §3 invariant 4).
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(name, attr)| (name.as_str(), attr))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.attributes.shift_remove(name)
    }
}

/// Two handles name the same node iff they share an id. Useful when
/// comparing handles obtained from independent lookups.
pub fn same_element(a: &ElementHandle, b: &ElementHandle) -> bool {
    Rc::ptr_eq(a, b) || a.borrow().id == b.borrow().id
}
