//! # dmx-datamodel
//! An in-memory object model and codec container for Valve's DMX datamodel
//! format: a structured graph of elements and typed attributes, organized
//! around a pluggable wire-format layer rather than one baked-in encoding.
//!
//! This is an implementation of the data structure designed by Valve
//! Corporation, used throughout Source and Source 2. It stores data
//! generically while keeping strong typing on value access; elements hold
//! attribute data and may reference other elements, including themselves,
//! forming a cyclic graph.
//!
//! ## Usage
//! Every datamodel has a format tag/version and, usually, a root element.
//! ```
//! use dmx_datamodel::{Datamodel, Value};
//!
//! let model = Datamodel::new("model", 1);
//! let root = model.create_element("DmElement", "root", None).unwrap();
//! model.set_root(&root).unwrap();
//! ```
//! To add attributes to an element:
//! ```
//! # use dmx_datamodel::{Datamodel, Value};
//! # let model = Datamodel::new("model", 1);
//! # let root = model.create_element("DmElement", "root", None).unwrap();
//! model.set_attribute(&root, "length", Value::Int32(42)).unwrap();
//! model.set_attribute(&root, "size", Value::Float32(10.45)).unwrap();
//! ```
//! To read a value back:
//! ```
//! # use dmx_datamodel::{Datamodel, Value};
//! # let model = Datamodel::new("model", 1);
//! # let root = model.create_element("DmElement", "root", None).unwrap();
//! # model.set_attribute(&root, "length", Value::Int32(42)).unwrap();
//! let length = root.borrow_mut().get_attribute("length").unwrap();
//! assert!(matches!(length, Value::Int32(42)));
//! ```
//! To save a model:
//! ```
//! # use dmx_datamodel::Datamodel;
//! # let model = Datamodel::new("model", 1);
//! let mut buffer = Vec::new();
//! model.save(&mut buffer, "keyvalues2", 1).unwrap();
//! ```
//! And to load one back, choosing how eagerly deferred attributes
//! materialize:
//! ```
//! # use dmx_datamodel::{Datamodel, DeferredMode};
//! # let model = dmx_datamodel::Datamodel::new("model", 1);
//! # let mut buffer = Vec::new();
//! # model.save(&mut buffer, "keyvalues2", 1).unwrap();
//! let loaded = Datamodel::load(buffer, DeferredMode::Automatic).unwrap();
//! ```

pub mod attribute;
pub use attribute::Attribute;

pub mod codec;
pub use codec::{Codec, DeferredMode, Header};

pub mod datamodel;
pub use datamodel::{Datamodel, ImportMode};

pub mod element;
pub use element::{same_element, Element, ElementHandle};

pub mod element_array;
pub use element_array::ElementArray;

pub mod error;
pub use error::{Error, Result};

pub mod serializers;

pub mod value;
pub use value::{Angle, Color, Matrix4, Quaternion, Value, Vector2, Vector3, Vector4};
