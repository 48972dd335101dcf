//! The root container: format tag, version, root element, element
//! registry, bound codec, and stub-resolution hook (spec §3, §4.4).

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::codec::{self, Codec, DeferredMode, Header};
use crate::element::{DatamodelWeak, Element, ElementHandle};
use crate::error::Error;
use crate::value::Value;

/// How much of an imported element's reachable subgraph to copy (spec
/// §4.4 `ImportElement`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportMode {
    /// Copy attributes; element references become stubs of the originals.
    Shallow,
    /// Recurse: the whole reachable subgraph is copied.
    Deep,
    /// Create only a stub carrying the source id.
    Stub,
}

type StubResolver = dyn Fn(Uuid) -> Option<ElementHandle>;

pub(crate) struct DatamodelInner {
    format: String,
    format_version: i32,
    root: Option<ElementHandle>,
    registry: IndexMap<Uuid, ElementHandle>,
    codec: Option<Rc<dyn Codec>>,
    /// `Rc`, not `Box`: [`request_stub`] clones this out and drops its
    /// borrow of `DatamodelInner` before calling it, so a resolver that
    /// itself calls back into this datamodel (e.g. `create_element`)
    /// doesn't deadlock against its own borrow.
    stub_resolver: Option<Rc<StubResolver>>,
}

/// The top-level container: a registry of owned [`Element`]s, a root
/// element, a format tag/version, and an optional bound [`Codec`].
///
/// Cheap to clone — a `Datamodel` is a reference-counted handle onto shared
/// state, the same arena every element and attribute in its graph refers
/// back to (spec §9, Design Notes on arenas).
#[derive(Clone)]
pub struct Datamodel(Rc<RefCell<DatamodelInner>>);

impl Datamodel {
    pub fn new(format: impl Into<String>, format_version: i32) -> Self {
        Self(Rc::new(RefCell::new(DatamodelInner {
            format: format.into(),
            format_version,
            root: None,
            registry: IndexMap::new(),
            codec: None,
            stub_resolver: None,
        })))
    }

    fn weak(&self) -> DatamodelWeak {
        Rc::downgrade(&self.0)
    }

    pub fn format(&self) -> String {
        self.0.borrow().format.clone()
    }

    pub fn format_version(&self) -> i32 {
        self.0.borrow().format_version
    }

    pub fn root(&self) -> Option<ElementHandle> {
        self.0.borrow().root.clone()
    }

    /// Sets the root element, adopting it if detached. Fails with
    /// [`Error::ElementOwnership`] if it's owned by a different datamodel.
    pub fn set_root(&self, element: &ElementHandle) -> Result<(), Error> {
        self.adopt(element)?;
        self.0.borrow_mut().root = Some(element.clone());
        Ok(())
    }

    fn adopt(&self, element: &ElementHandle) -> Result<(), Error> {
        element.borrow_mut().adopt(&self.weak())
    }

    /// All elements this datamodel owns, in registry (creation) order.
    pub fn all_elements(&self) -> Vec<ElementHandle> {
        self.0.borrow().registry.values().cloned().collect()
    }

    pub fn element(&self, id: Uuid) -> Option<ElementHandle> {
        self.0.borrow().registry.get(&id).cloned()
    }

    /// Creates a fresh element owned by this datamodel. Fails with
    /// [`Error::ElementIdInUse`] if `id` is given and already registered
    /// (spec §4.4).
    pub fn create_element(&self, class_name: impl Into<String>, name: impl Into<String>, id: Option<Uuid>) -> Result<ElementHandle, Error> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        if self.0.borrow().registry.contains_key(&id) {
            return Err(Error::ElementIdInUse { id });
        }
        let element = Element::new(id, name, class_name);
        element.borrow_mut().adopt(&self.weak())?;
        self.0.borrow_mut().registry.insert(id, element.clone());
        Ok(element)
    }

    /// Returns the registered element for `id`, creating a detached stub
    /// and registering it if none exists yet.
    pub(crate) fn stub_for(&self, id: Uuid) -> ElementHandle {
        if let Some(existing) = self.element(id) {
            return existing;
        }
        let stub = Element::new_stub(id, self.weak());
        self.0.borrow_mut().registry.insert(id, stub.clone());
        stub
    }

    /// Removes `id` from the registry. References to it elsewhere become
    /// dangling; the library does not rewrite back-references (spec §4.4).
    pub fn remove_element(&self, id: Uuid) -> Option<ElementHandle> {
        self.0.borrow_mut().registry.shift_remove(&id)
    }

    /// Copies `src` (and, per `mode`, its reachable subgraph) into this
    /// datamodel (spec §4.4 `ImportElement`).
    pub fn import_element(&self, src: &ElementHandle, mode: ImportMode, assign_fresh_ids: bool) -> Result<ElementHandle, Error> {
        let mut visited = HashMap::new();
        self.import_recursive(src, mode, assign_fresh_ids, &mut visited)
    }

    fn import_recursive(
        &self,
        src: &ElementHandle,
        mode: ImportMode,
        assign_fresh_ids: bool,
        visited: &mut HashMap<Uuid, ElementHandle>,
    ) -> Result<ElementHandle, Error> {
        let src_id = src.borrow().id();
        if let Some(existing) = visited.get(&src_id) {
            return Ok(existing.clone());
        }

        if mode == ImportMode::Stub || src.borrow().is_stub() {
            let stub = self.stub_for(src_id);
            visited.insert(src_id, stub.clone());
            return Ok(stub);
        }

        let new_id = if assign_fresh_ids { Uuid::new_v4() } else { src_id };
        let copy = self.create_element(src.borrow().class_name().to_string(), src.borrow().name().to_string(), Some(new_id))?;
        visited.insert(src_id, copy.clone());

        let names: Vec<String> = src.borrow().attributes().map(|(name, _)| name.to_string()).collect();
        let attrs: Vec<(String, Value)> = {
            let mut src_mut = src.borrow_mut();
            names
                .into_iter()
                .map(|name| {
                    let value = src_mut.get_attribute(&name)?;
                    Ok((name, value))
                })
                .collect::<Result<Vec<_>, Error>>()?
        };

        for (name, value) in attrs {
            let imported = match (mode, value) {
                (ImportMode::Deep, Value::Element(Some(handle))) => Value::Element(Some(self.import_recursive(&handle, mode, assign_fresh_ids, visited)?)),
                (_, Value::Element(Some(handle))) => Value::Element(Some(self.stub_for(handle.borrow().id()))),
                (ImportMode::Deep, Value::ElementArray(array)) => {
                    let mut items = Vec::with_capacity(array.len());
                    for item in array.iter() {
                        items.push(match item {
                            Some(handle) => Some(self.import_recursive(handle, mode, assign_fresh_ids, visited)?),
                            None => None,
                        });
                    }
                    Value::ElementArray(crate::element_array::ElementArray::from_vec(items))
                }
                (_, Value::ElementArray(array)) => {
                    let items = array.iter().map(|item| item.as_ref().map(|handle| self.stub_for(handle.borrow().id()))).collect();
                    Value::ElementArray(crate::element_array::ElementArray::from_vec(items))
                }
                (_, other) => other,
            };
            self.set_attribute(&copy, name, imported)?;
        }

        Ok(copy)
    }

    /// Sets (creating or overwriting) an attribute on `element`, running
    /// the same ownership checks [`crate::Attribute::set`] would.
    pub fn set_attribute(&self, element: &ElementHandle, name: impl Into<String>, mut value: Value) -> Result<(), Error> {
        let name = name.into();

        if let Value::Element(Some(handle)) = &value {
            if !handle.borrow().is_stub() {
                handle.borrow_mut().adopt(&self.weak())?;
            }
        }
        if let Value::ElementArray(array) = &mut value {
            array.attach(element)?;
            for item in array.iter().flatten() {
                if !item.borrow().is_stub() {
                    item.borrow_mut().adopt(&self.weak())?;
                }
            }
        }

        let mut attribute = crate::attribute::Attribute::new(name, value);
        attribute.owner = Rc::downgrade(element);
        element.borrow_mut().insert_attribute(attribute);
        Ok(())
    }

    /// Installs the callback used to materialize stub references on first
    /// access (spec §4.4 `OnStubRequest`).
    pub fn set_stub_resolver(&self, resolver: impl Fn(Uuid) -> Option<ElementHandle> + 'static) {
        self.0.borrow_mut().stub_resolver = Some(Rc::new(resolver));
    }

    pub fn clear_stub_resolver(&self) {
        self.0.borrow_mut().stub_resolver = None;
    }

    pub(crate) fn bind_codec(&self, codec: Rc<dyn Codec>) {
        self.0.borrow_mut().codec = Some(codec);
    }

    /// The codec bound to this datamodel, if it was produced by
    /// [`Datamodel::load`]. Deferred attributes hold their own clone of it
    /// directly, so this is only needed while a decode is in progress.
    pub(crate) fn codec(&self) -> Option<Rc<dyn Codec>> {
        self.0.borrow().codec.clone()
    }

    /// Saves this datamodel using the codec registered for `(encoding,
    /// version)`. Fails with [`Error::CodecNotFound`] if none is registered
    /// (spec §4.4 `Save`).
    pub fn save(&self, sink: &mut dyn Write, encoding: &str, version: i32) -> Result<(), Error> {
        codec::ensure_default_codecs_registered();
        let codec = codec::lookup_codec(encoding, version)?;
        let header = Header::new(encoding, version, self.format(), self.format_version());
        sink.write_all(header.to_line().as_bytes())?;
        codec.encode(self, sink, version)
    }

    /// Loads a datamodel from `source`, sniffing the header to pick a
    /// codec. Fails with [`Error::CodecNotFound`] if the header names an
    /// unregistered `(encoding, version)` pair, without consuming any bytes
    /// past the header (spec §4.4 `Load`, §8 scenario 6).
    pub fn load(source: Vec<u8>, deferred_mode: DeferredMode) -> Result<Self, Error> {
        codec::ensure_default_codecs_registered();
        let header = Header::sniff(&source)?;
        let codec = codec::lookup_codec(&header.encoding_name, header.encoding_version)?;
        codec.decode(source, &header, deferred_mode)
    }

    /// Invokes the user-supplied stub resolver for `id` (spec §4.4
    /// `OnStubRequest`). Returning `None` means "leave as stub".
    pub fn on_stub_request(&self, id: Uuid) -> Option<ElementHandle> {
        request_stub(&self.0, id)
    }

    /// Releases the bound codec (which in turn releases whatever stream it
    /// holds) and discards the registry. Further deferred-attribute access
    /// fails with [`Error::Codec`] ("codec disposed") (spec §5, "resource
    /// lifecycle").
    pub fn dispose(&self) {
        let mut inner = self.0.borrow_mut();
        if let Some(codec) = inner.codec.take() {
            codec.dispose();
        }
        inner.registry.clear();
        inner.root = None;
        inner.stub_resolver = None;
    }
}

/// Called from [`crate::Attribute::get`] when it encounters a stub element
/// reference, to invoke the owning datamodel's stub resolver and, on
/// success, register the resolved element.
pub(crate) fn request_stub(datamodel: &Rc<RefCell<DatamodelInner>>, id: Uuid) -> Option<ElementHandle> {
    let resolver = datamodel.borrow().stub_resolver.clone()?;
    let resolver_result = resolver(id)?;
    let _ = resolver_result.borrow_mut().adopt(&Rc::downgrade(datamodel));
    datamodel.borrow_mut().registry.insert(id, resolver_result.clone());
    Some(resolver_result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_element_generates_id_when_absent() {
        let dm = Datamodel::new("model", 1);
        let element = dm.create_element("DmElement", "root", None).unwrap();
        assert!(dm.element(element.borrow().id()).is_some());
    }

    #[test]
    fn create_element_rejects_id_collision() {
        let dm = Datamodel::new("model", 1);
        let id = Uuid::new_v4();
        dm.create_element("DmElement", "a", Some(id)).unwrap();
        assert!(matches!(dm.create_element("DmElement", "b", Some(id)), Err(Error::ElementIdInUse { .. })));
    }

    #[test]
    fn set_attribute_rejects_cross_datamodel_element() {
        let a = Datamodel::new("model", 1);
        let b = Datamodel::new("model", 1);
        let owned_by_a = a.create_element("DmElement", "a-child", None).unwrap();
        let root_b = b.create_element("DmElement", "b-root", None).unwrap();

        let result = b.set_attribute(&root_b, "child", Value::Element(Some(owned_by_a)));
        assert!(matches!(result, Err(Error::ElementOwnership { .. })));
        assert!(!root_b.borrow().has_attribute("child"));
    }

    #[test]
    fn stub_resolver_materializes_on_next_read() {
        let dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmElement", "root", None).unwrap();
        let target_id = Uuid::new_v4();
        let stub = Element::new_stub(target_id, Rc::downgrade(&dm.0));
        dm.0.borrow_mut().registry.insert(target_id, stub.clone());
        dm.set_attribute(&root, "link", Value::Element(Some(stub))).unwrap();

        let resolved = dm.create_element("DmRealThing", "resolved", Some(target_id)).ok();
        assert!(resolved.is_none()); // id already registered as a stub

        dm.set_stub_resolver(move |id| {
            if id == target_id {
                Some(Element::new(id, "resolved", "DmRealThing"))
            } else {
                None
            }
        });

        let value = root.borrow_mut().get_attribute("link").unwrap();
        match value {
            Value::Element(Some(handle)) => assert!(!handle.borrow().is_stub()),
            _ => panic!("expected element"),
        }
    }
}
