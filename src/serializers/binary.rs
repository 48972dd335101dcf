//! Binary encoding, versions 1-5.
//!
//! Grounded in the teacher's `serializing/binary.rs` (`DataReader`/
//! `DataWriter`, the version-gated string table, little-endian scalar
//! reads) and cross-checked against `other_examples/leops-dmxparser`'s
//! `AttributeType` byte values for the scalar/array tag numbering.
//!
//! Wire shape of the body (everything after the header line):
//! ```text
//! string_table?            (version >= 2; count width and index width vary by version)
//! root_id: [u8; 16]
//! element_count: u32
//! element_count * { class_name, element_name, id: [u8; 16] }   // pass 1
//! element_count * { attribute_count: u32, attribute_count * { name, tag: u8, payload } }  // pass 2, same order
//! bulk section: deferred attribute payloads, addressed by absolute offset from the deferred markers in pass 2
//! ```
//! Splitting element headers (pass 1) from attribute bodies (pass 2) means
//! every element exists in the registry, by id, before any attribute is
//! decoded, so element references — forward, backward, or cyclic — always
//! resolve against an already-populated registry (spec §9, Design Notes).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use indexmap::IndexSet;
use uuid::Uuid;

use crate::codec::{Codec, DeferredMode, Header};
use crate::datamodel::Datamodel;
use crate::element::ElementHandle;
use crate::element_array::ElementArray;
use crate::error::Error;
use crate::value::{Angle, Color, Matrix4, Quaternion, Value, Vector2, Vector3, Vector4};

const TAG_ELEMENT: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_FLOAT32: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BINARY: u8 = 6;
const TAG_TIME: u8 = 7;
const TAG_COLOR: u8 = 8;
const TAG_VECTOR2: u8 = 9;
const TAG_VECTOR3: u8 = 10;
const TAG_VECTOR4: u8 = 11;
const TAG_ANGLE: u8 = 12;
const TAG_QUATERNION: u8 = 13;
const TAG_MATRIX: u8 = 14;

const TAG_ELEMENT_ARRAY: u8 = 33;
const TAG_INT32_ARRAY: u8 = 34;
const TAG_FLOAT32_ARRAY: u8 = 35;
const TAG_BOOL_ARRAY: u8 = 36;
const TAG_STRING_ARRAY: u8 = 37;
const TAG_BINARY_ARRAY: u8 = 38;
const TAG_TIME_ARRAY: u8 = 39;
const TAG_COLOR_ARRAY: u8 = 40;
const TAG_VECTOR2_ARRAY: u8 = 41;
const TAG_VECTOR3_ARRAY: u8 = 42;
const TAG_VECTOR4_ARRAY: u8 = 43;
const TAG_ANGLE_ARRAY: u8 = 44;
const TAG_QUATERNION_ARRAY: u8 = 45;
const TAG_MATRIX_ARRAY: u8 = 46;

/// Markers written in place of an inline array payload when the value was
/// placed in the bulk section instead. Outside the real tag range so they
/// never collide with an inline kind. Only these three kinds are ever
/// bulked (spec §6: "long arrays and binary blobs").
const TAG_DEFERRED_INT32_ARRAY: u8 = 200;
const TAG_DEFERRED_FLOAT32_ARRAY: u8 = 201;
const TAG_DEFERRED_BINARY_ARRAY: u8 = 202;

/// Arrays at or under this byte length always stay inline.
const AUTO_DEFER_BYTES: usize = 64;

fn attribute_version_for(encoding_version: i32) -> i32 {
    if encoding_version >= 5 {
        2
    } else {
        1
    }
}

pub struct BinaryCodec {
    version: i32,
    body: Vec<u8>,
    lock: Mutex<()>,
    disposed: AtomicBool,
}

impl BinaryCodec {
    pub fn new(version: i32) -> Self {
        Self { version, body: Vec::new(), lock: Mutex::new(()), disposed: AtomicBool::new(false) }
    }
}

impl Codec for BinaryCodec {
    fn encoding_name(&self) -> &'static str {
        "binary"
    }

    fn encoding_version(&self) -> i32 {
        self.version
    }

    fn encode(&self, datamodel: &Datamodel, sink: &mut dyn std::io::Write, _format_version: i32) -> Result<(), Error> {
        let mut writer = Writer::new(self.version);
        writer.write_datamodel(datamodel)?;
        sink.write_all(&writer.finish())?;
        Ok(())
    }

    fn decode(self: std::rc::Rc<Self>, source: Vec<u8>, header: &Header, deferred_mode: DeferredMode) -> Result<Datamodel, Error> {
        let header_end = source.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(0);
        let body = source[header_end..].to_vec();

        let bound = std::rc::Rc::new(Self { version: self.version, body, lock: Mutex::new(()), disposed: AtomicBool::new(false) });
        let datamodel = Datamodel::new(header.format.clone(), header.format_version);
        datamodel.bind_codec(bound.clone());

        let mut reader = Reader::new(&bound.body, header.encoding_version);
        reader.read_datamodel(&datamodel, deferred_mode)?;
        Ok(datamodel)
    }

    fn deferred_decode_attribute(&self, offset: u64) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        if self.is_disposed() {
            return Err(Box::new(Error::InvalidOperation("codec disposed".into())));
        }
        let _guard = self.lock.lock().unwrap();
        let mut reader = Reader::new(&self.body, self.version);
        reader.pos = offset as usize;
        let tag = reader.read_u8().map_err(box_err)?;
        reader.read_scalar_value(tag).map_err(box_err)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

fn box_err(e: Error) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

// ---------------------------------------------------------------- writer

struct Writer {
    version: i32,
    main: Vec<u8>,
    bulk: Vec<u8>,
    /// Byte positions in `main` holding a bulk-relative `u64` placeholder
    /// that must become `main.len() + placeholder` once `main` is final.
    patches: Vec<usize>,
    string_table: IndexSet<String>,
}

impl Writer {
    fn new(version: i32) -> Self {
        Self { version, main: Vec::new(), bulk: Vec::new(), patches: Vec::new(), string_table: IndexSet::new() }
    }

    fn finish(mut self) -> Vec<u8> {
        let base = self.main.len() as u64;
        for pos in &self.patches {
            let rel = u64::from_le_bytes(self.main[*pos..*pos + 8].try_into().unwrap());
            self.main[*pos..*pos + 8].copy_from_slice(&(base + rel).to_le_bytes());
        }
        let mut out = self.main;
        out.extend(self.bulk);
        out
    }

    fn write_datamodel(&mut self, datamodel: &Datamodel) -> Result<(), Error> {
        let elements = datamodel.all_elements();

        if self.version >= 2 {
            self.gather_strings(&elements)?;
            self.write_string_table();
        }

        let root_id = datamodel.root().map(|r| r.borrow().id()).unwrap_or(Uuid::nil());
        self.write_uuid(root_id);

        self.write_u32(elements.len() as u32);
        for element in &elements {
            let element = element.borrow();
            self.write_string(element.class_name(), true);
            self.write_string(element.name(), self.version >= 4);
            self.write_uuid(element.id());
        }

        let attribute_version = attribute_version_for(self.version);
        for element in &elements {
            let names: Vec<String> = element.borrow().attributes().map(|(name, _)| name.to_string()).collect();
            let attrs: Vec<(String, Value)> = {
                let mut element = element.borrow_mut();
                names
                    .into_iter()
                    .map(|name| {
                        let value = element.get_attribute(&name)?;
                        Ok((name, value))
                    })
                    .collect::<Result<Vec<_>, Error>>()?
            };
            self.write_u32(attrs.len() as u32);
            for (name, value) in attrs {
                self.write_string(&name, true);
                self.write_value(&value, attribute_version)?;
            }
        }

        Ok(())
    }

    fn gather_strings(&mut self, elements: &[ElementHandle]) -> Result<(), Error> {
        for element in elements {
            let names: Vec<String> = {
                let element = element.borrow();
                self.string_table.insert(element.class_name().to_string());
                if self.version >= 4 {
                    self.string_table.insert(element.name().to_string());
                }
                element.attributes().map(|(name, _)| name.to_string()).collect()
            };
            for name in names {
                self.string_table.insert(name.clone());
                if self.version >= 4 {
                    match element.borrow_mut().get_attribute(&name)? {
                        Value::String(s) => {
                            self.string_table.insert(s);
                        }
                        Value::StringArray(items) => {
                            for s in items {
                                self.string_table.insert(s);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn write_string_table(&mut self) {
        if self.version >= 4 {
            self.write_u32(self.string_table.len() as u32);
        } else {
            self.write_u16(self.string_table.len() as u16);
        }
        let strings: Vec<String> = self.string_table.iter().cloned().collect();
        for s in strings {
            self.write_cstr(&s);
        }
    }

    fn write_table_ref(&mut self, s: &str) {
        let index = self.string_table.get_index_of(s).expect("string was gathered before encoding");
        if self.version >= 5 {
            self.write_u32(index as u32);
        } else {
            self.write_u16(index as u16);
        }
    }

    /// Writes `s` through the string table when `table_eligible` and this
    /// version carries a table at all, else inline as a C string.
    fn write_string(&mut self, s: &str, table_eligible: bool) {
        if self.version >= 2 && table_eligible {
            self.write_table_ref(s);
        } else {
            self.write_cstr(s);
        }
    }

    fn write_u8(&mut self, v: u8) {
        self.main.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.main.extend(v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.main.extend(v.to_le_bytes());
    }

    fn write_i32(&mut self, v: i32) {
        self.main.extend(v.to_le_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.main.extend(v.to_le_bytes());
    }

    fn write_f32(&mut self, v: f32) {
        self.main.extend(v.to_le_bytes());
    }

    fn write_uuid(&mut self, v: Uuid) {
        self.main.extend(v.to_bytes_le());
    }

    fn write_cstr(&mut self, s: &str) {
        self.main.extend(s.as_bytes());
        self.main.push(0);
    }

    fn write_value(&mut self, value: &Value, attribute_version: i32) -> Result<(), Error> {
        match value {
            Value::Element(handle) => {
                self.write_u8(TAG_ELEMENT);
                self.write_uuid(handle.as_ref().map(|h| h.borrow().id()).unwrap_or(Uuid::nil()));
            }
            Value::Int32(v) => {
                self.write_u8(TAG_INT32);
                self.write_i32(*v);
            }
            Value::Float32(v) => {
                self.write_u8(TAG_FLOAT32);
                self.write_f32(*v);
            }
            Value::Bool(v) => {
                self.write_u8(TAG_BOOL);
                self.write_u8(*v as u8);
            }
            Value::String(v) => {
                self.write_u8(TAG_STRING);
                self.write_string(v, self.version >= 4);
            }
            Value::Binary(v) => {
                self.write_u8(TAG_BINARY);
                self.write_u32(v.len() as u32);
                self.main.extend(v);
            }
            Value::TimeSpan(v) => {
                if attribute_version < 2 {
                    return Err(Error::AttributeType { name: "time".into() });
                }
                self.write_u8(TAG_TIME);
                self.write_i64(v.num_microseconds().unwrap_or(0));
            }
            Value::Color(v) => {
                self.write_u8(TAG_COLOR);
                self.main.extend([v.r, v.g, v.b, v.a]);
            }
            Value::Vector2(v) => {
                self.write_u8(TAG_VECTOR2);
                self.write_f32(v.x);
                self.write_f32(v.y);
            }
            Value::Vector3(v) => {
                self.write_u8(TAG_VECTOR3);
                self.write_f32(v.x);
                self.write_f32(v.y);
                self.write_f32(v.z);
            }
            Value::Vector4(v) => {
                self.write_u8(TAG_VECTOR4);
                self.write_f32(v.x);
                self.write_f32(v.y);
                self.write_f32(v.z);
                self.write_f32(v.w);
            }
            Value::Angle(v) => {
                self.write_u8(TAG_ANGLE);
                self.write_f32(v.pitch);
                self.write_f32(v.yaw);
                self.write_f32(v.roll);
            }
            Value::Quaternion(v) => {
                self.write_u8(TAG_QUATERNION);
                self.write_f32(v.x);
                self.write_f32(v.y);
                self.write_f32(v.z);
                self.write_f32(v.w);
            }
            Value::Matrix4(v) => {
                self.write_u8(TAG_MATRIX);
                for row in v.0 {
                    for c in row {
                        self.write_f32(c);
                    }
                }
            }
            Value::ElementArray(array) => {
                self.write_u8(TAG_ELEMENT_ARRAY);
                self.write_u32(array.len() as u32);
                for item in array.iter() {
                    self.write_uuid(item.as_ref().map(|h| h.borrow().id()).unwrap_or(Uuid::nil()));
                }
            }
            Value::Int32Array(items) => {
                self.write_deferrable_array(items, TAG_INT32_ARRAY, TAG_DEFERRED_INT32_ARRAY, |buf, v: &i32| buf.extend(v.to_le_bytes()))
            }
            Value::Float32Array(items) => {
                self.write_deferrable_array(items, TAG_FLOAT32_ARRAY, TAG_DEFERRED_FLOAT32_ARRAY, |buf, v: &f32| buf.extend(v.to_le_bytes()))
            }
            Value::BoolArray(items) => {
                self.write_u8(TAG_BOOL_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_u8(*v as u8);
                }
            }
            Value::StringArray(items) => {
                self.write_u8(TAG_STRING_ARRAY);
                self.write_u32(items.len() as u32);
                let table_eligible = self.version >= 4;
                for v in items {
                    self.write_string(v, table_eligible);
                }
            }
            Value::BinaryArray(items) => self.write_deferrable_blob_array(items),
            Value::TimeSpanArray(items) => {
                if attribute_version < 2 {
                    return Err(Error::AttributeType { name: "time_array".into() });
                }
                self.write_u8(TAG_TIME_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_i64(v.num_microseconds().unwrap_or(0));
                }
            }
            Value::ColorArray(items) => {
                self.write_u8(TAG_COLOR_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.main.extend([v.r, v.g, v.b, v.a]);
                }
            }
            Value::Vector2Array(items) => {
                self.write_u8(TAG_VECTOR2_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_f32(v.x);
                    self.write_f32(v.y);
                }
            }
            Value::Vector3Array(items) => {
                self.write_u8(TAG_VECTOR3_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_f32(v.x);
                    self.write_f32(v.y);
                    self.write_f32(v.z);
                }
            }
            Value::Vector4Array(items) => {
                self.write_u8(TAG_VECTOR4_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_f32(v.x);
                    self.write_f32(v.y);
                    self.write_f32(v.z);
                    self.write_f32(v.w);
                }
            }
            Value::AngleArray(items) => {
                self.write_u8(TAG_ANGLE_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_f32(v.pitch);
                    self.write_f32(v.yaw);
                    self.write_f32(v.roll);
                }
            }
            Value::QuaternionArray(items) => {
                self.write_u8(TAG_QUATERNION_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    self.write_f32(v.x);
                    self.write_f32(v.y);
                    self.write_f32(v.z);
                    self.write_f32(v.w);
                }
            }
            Value::Matrix4Array(items) => {
                self.write_u8(TAG_MATRIX_ARRAY);
                self.write_u32(items.len() as u32);
                for v in items {
                    for row in v.0 {
                        for c in row {
                            self.write_f32(c);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes `items` inline, unless their encoded size clears
    /// [`AUTO_DEFER_BYTES`], in which case the payload goes to the bulk
    /// section and `main` gets a deferred marker plus a patched offset.
    fn write_deferrable_array<T: Copy>(&mut self, items: &[T], inline_tag: u8, deferred_tag: u8, write_one: impl Fn(&mut Vec<u8>, &T)) {
        let byte_len = items.len() * std::mem::size_of::<T>();
        if byte_len > AUTO_DEFER_BYTES {
            let bulk_offset = self.bulk.len() as u64;
            self.bulk.push(inline_tag);
            self.bulk.extend((items.len() as u32).to_le_bytes());
            for item in items {
                write_one(&mut self.bulk, item);
            }
            self.write_u8(deferred_tag);
            let patch_pos = self.main.len();
            self.main.extend(bulk_offset.to_le_bytes());
            self.patches.push(patch_pos);
        } else {
            self.write_u8(inline_tag);
            self.write_u32(items.len() as u32);
            for item in items {
                write_one(&mut self.main, item);
            }
        }
    }

    fn write_deferrable_blob_array(&mut self, items: &[Vec<u8>]) {
        let byte_len: usize = items.iter().map(|v| v.len() + 4).sum();
        if byte_len > AUTO_DEFER_BYTES {
            let bulk_offset = self.bulk.len() as u64;
            self.bulk.push(TAG_BINARY_ARRAY);
            self.bulk.extend((items.len() as u32).to_le_bytes());
            for item in items {
                self.bulk.extend((item.len() as u32).to_le_bytes());
                self.bulk.extend(item);
            }
            self.write_u8(TAG_DEFERRED_BINARY_ARRAY);
            let patch_pos = self.main.len();
            self.main.extend(bulk_offset.to_le_bytes());
            self.patches.push(patch_pos);
        } else {
            self.write_u8(TAG_BINARY_ARRAY);
            self.write_u32(items.len() as u32);
            for item in items {
                self.write_u32(item.len() as u32);
                self.main.extend(item);
            }
        }
    }
}

// ---------------------------------------------------------------- reader

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    version: i32,
    string_table: Vec<String>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], version: i32) -> Self {
        Self { data, pos: 0, version, string_table: Vec::new() }
    }

    fn read_datamodel(&mut self, datamodel: &Datamodel, deferred_mode: DeferredMode) -> Result<(), Error> {
        if self.version >= 2 {
            self.read_string_table()?;
        }

        let root_id = self.read_uuid()?;

        let element_count = self.read_u32()? as usize;
        let mut handles = Vec::with_capacity(element_count);
        for _ in 0..element_count {
            let class_name = self.read_string(true)?;
            let element_name = self.read_string(self.version >= 4)?;
            let id = self.read_uuid()?;
            let element = match datamodel.element(id) {
                Some(existing) => existing,
                None => datamodel.create_element(class_name.clone(), element_name.clone(), Some(id))?,
            };
            {
                let mut element_mut = element.borrow_mut();
                element_mut.set_class_name(class_name);
                element_mut.set_name(element_name);
            }
            handles.push(element);
        }

        for element in &handles {
            let attribute_count = self.read_u32()? as usize;
            for _ in 0..attribute_count {
                let name = self.read_string(true)?;
                let tag = self.read_u8()?;
                self.read_attribute(datamodel, element, &name, tag, deferred_mode)?;
            }
        }

        if root_id != Uuid::nil() {
            let root = datamodel.element(root_id).unwrap_or_else(|| datamodel.stub_for(root_id));
            datamodel.set_root(&root)?;
        }

        Ok(())
    }

    fn read_attribute(&mut self, datamodel: &Datamodel, element: &ElementHandle, name: &str, tag: u8, deferred_mode: DeferredMode) -> Result<(), Error> {
        match tag {
            TAG_DEFERRED_INT32_ARRAY | TAG_DEFERRED_FLOAT32_ARRAY | TAG_DEFERRED_BINARY_ARRAY => {
                let offset = self.read_u64()?;
                if deferred_mode == DeferredMode::Disabled {
                    let saved = self.pos;
                    self.pos = offset as usize;
                    let inline_tag = self.read_u8()?;
                    let value = self.read_scalar_value(inline_tag)?;
                    self.pos = saved;
                    datamodel.set_attribute(element, name, value)
                } else {
                    let codec = datamodel.codec().ok_or_else(|| Error::UnsupportedFormat("datamodel has no bound codec during decode".into()))?;
                    let mut attribute = crate::attribute::Attribute::new_deferred(name, offset, codec);
                    attribute.owner = std::rc::Rc::downgrade(element);
                    element.borrow_mut().insert_attribute(attribute);
                    Ok(())
                }
            }
            _ => {
                let value = self.read_value(tag, datamodel)?;
                datamodel.set_attribute(element, name, value)
            }
        }
    }

    fn read_value(&mut self, tag: u8, datamodel: &Datamodel) -> Result<Value, Error> {
        match tag {
            TAG_ELEMENT => {
                let id = self.read_uuid()?;
                Ok(Value::Element(self.resolve_element(datamodel, id)))
            }
            TAG_ELEMENT_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = self.read_uuid()?;
                    items.push(self.resolve_element(datamodel, id));
                }
                Ok(Value::ElementArray(ElementArray::from_vec(items)))
            }
            _ => self.read_scalar_value(tag),
        }
    }

    fn resolve_element(&mut self, datamodel: &Datamodel, id: Uuid) -> Option<ElementHandle> {
        if id == Uuid::nil() {
            return None;
        }
        Some(datamodel.element(id).unwrap_or_else(|| datamodel.stub_for(id)))
    }

    /// Decodes every kind that never carries an element reference — the
    /// subset [`crate::codec::Codec::deferred_decode_attribute`] is allowed
    /// to produce, and the only kinds that can appear inside a deferred
    /// marker's bulk payload.
    fn read_scalar_value(&mut self, tag: u8) -> Result<Value, Error> {
        Ok(match tag {
            TAG_INT32 => Value::Int32(self.read_i32()?),
            TAG_FLOAT32 => Value::Float32(self.read_f32()?),
            TAG_BOOL => Value::Bool(self.read_u8()? != 0),
            TAG_STRING => Value::String(self.read_string(self.version >= 4)?),
            TAG_BINARY => {
                let len = self.read_u32()? as usize;
                Value::Binary(self.read_bytes(len)?.to_vec())
            }
            TAG_TIME => Value::TimeSpan(chrono::Duration::microseconds(self.read_i64()?)),
            TAG_COLOR => {
                let bytes = self.read_bytes(4)?;
                Value::Color(Color::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            }
            TAG_VECTOR2 => Value::Vector2(Vector2 { x: self.read_f32()?, y: self.read_f32()? }),
            TAG_VECTOR3 => Value::Vector3(Vector3 { x: self.read_f32()?, y: self.read_f32()?, z: self.read_f32()? }),
            TAG_VECTOR4 => Value::Vector4(Vector4 { x: self.read_f32()?, y: self.read_f32()?, z: self.read_f32()?, w: self.read_f32()? }),
            TAG_ANGLE => Value::Angle(Angle { pitch: self.read_f32()?, yaw: self.read_f32()?, roll: self.read_f32()? }),
            TAG_QUATERNION => Value::Quaternion(Quaternion { x: self.read_f32()?, y: self.read_f32()?, z: self.read_f32()?, w: self.read_f32()? }),
            TAG_MATRIX => {
                let mut rows = [[0f32; 4]; 4];
                for row in rows.iter_mut() {
                    for c in row.iter_mut() {
                        *c = self.read_f32()?;
                    }
                }
                Value::Matrix4(Matrix4(rows))
            }
            TAG_INT32_ARRAY | TAG_DEFERRED_INT32_ARRAY => {
                let count = self.read_u32()? as usize;
                Value::Int32Array((0..count).map(|_| self.read_i32()).collect::<Result<_, _>>()?)
            }
            TAG_FLOAT32_ARRAY | TAG_DEFERRED_FLOAT32_ARRAY => {
                let count = self.read_u32()? as usize;
                Value::Float32Array((0..count).map(|_| self.read_f32()).collect::<Result<_, _>>()?)
            }
            TAG_BOOL_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_u8()? != 0);
                }
                Value::BoolArray(items)
            }
            TAG_STRING_ARRAY => {
                let count = self.read_u32()? as usize;
                let table_eligible = self.version >= 4;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_string(table_eligible)?);
                }
                Value::StringArray(items)
            }
            TAG_BINARY_ARRAY | TAG_DEFERRED_BINARY_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = self.read_u32()? as usize;
                    items.push(self.read_bytes(len)?.to_vec());
                }
                Value::BinaryArray(items)
            }
            TAG_TIME_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(chrono::Duration::microseconds(self.read_i64()?));
                }
                Value::TimeSpanArray(items)
            }
            TAG_COLOR_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let bytes = self.read_bytes(4)?;
                    items.push(Color::new(bytes[0], bytes[1], bytes[2], bytes[3]));
                }
                Value::ColorArray(items)
            }
            TAG_VECTOR2_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Vector2 { x: self.read_f32()?, y: self.read_f32()? });
                }
                Value::Vector2Array(items)
            }
            TAG_VECTOR3_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Vector3 { x: self.read_f32()?, y: self.read_f32()?, z: self.read_f32()? });
                }
                Value::Vector3Array(items)
            }
            TAG_VECTOR4_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Vector4 { x: self.read_f32()?, y: self.read_f32()?, z: self.read_f32()?, w: self.read_f32()? });
                }
                Value::Vector4Array(items)
            }
            TAG_ANGLE_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Angle { pitch: self.read_f32()?, yaw: self.read_f32()?, roll: self.read_f32()? });
                }
                Value::AngleArray(items)
            }
            TAG_QUATERNION_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Quaternion { x: self.read_f32()?, y: self.read_f32()?, z: self.read_f32()?, w: self.read_f32()? });
                }
                Value::QuaternionArray(items)
            }
            TAG_MATRIX_ARRAY => {
                let count = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut rows = [[0f32; 4]; 4];
                    for row in rows.iter_mut() {
                        for c in row.iter_mut() {
                            *c = self.read_f32()?;
                        }
                    }
                    items.push(Matrix4(rows));
                }
                Value::Matrix4Array(items)
            }
            other => return Err(Error::UnsupportedFormat(format!("unknown attribute tag {other}"))),
        })
    }

    fn read_string_table(&mut self) -> Result<(), Error> {
        let count = if self.version >= 4 { self.read_u32()? as usize } else { self.read_u16()? as usize };
        self.string_table = Vec::with_capacity(count);
        for _ in 0..count {
            self.string_table.push(self.read_cstr()?);
        }
        Ok(())
    }

    fn read_string(&mut self, table_eligible: bool) -> Result<String, Error> {
        if self.version >= 2 && table_eligible {
            let index = if self.version >= 5 { self.read_u32()? as usize } else { self.read_u16()? as usize };
            self.string_table.get(index).cloned().ok_or_else(|| Error::UnsupportedFormat("string table index out of range".into()))
        } else {
            self.read_cstr()
        }
    }

    fn read_cstr(&mut self) -> Result<String, Error> {
        let start = self.pos;
        let end = self.data[start..].iter().position(|&b| b == 0).ok_or_else(|| Error::UnsupportedFormat("unterminated string".into()))?;
        let s = String::from_utf8_lossy(&self.data[start..start + end]).into_owned();
        self.pos = start + end + 1;
        Ok(s)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.pos + len > self.data.len() {
            return Err(Error::UnsupportedFormat("unexpected end of buffer".into()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, Error> {
        Ok(f32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_uuid(&mut self) -> Result<Uuid, Error> {
        Ok(Uuid::from_bytes_le(self.read_bytes(16)?.try_into().unwrap()))
    }
}

pub(crate) fn factory_v1() -> std::rc::Rc<dyn Codec> {
    std::rc::Rc::new(BinaryCodec::new(1))
}
pub(crate) fn factory_v2() -> std::rc::Rc<dyn Codec> {
    std::rc::Rc::new(BinaryCodec::new(2))
}
pub(crate) fn factory_v3() -> std::rc::Rc<dyn Codec> {
    std::rc::Rc::new(BinaryCodec::new(3))
}
pub(crate) fn factory_v4() -> std::rc::Rc<dyn Codec> {
    std::rc::Rc::new(BinaryCodec::new(4))
}
pub(crate) fn factory_v5() -> std::rc::Rc<dyn Codec> {
    std::rc::Rc::new(BinaryCodec::new(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeferredMode;

    fn populate(dm: &Datamodel) -> ElementHandle {
        let root = dm.create_element("DmElement", "root", None).unwrap();
        dm.set_root(&root).unwrap();
        dm.set_attribute(&root, "name", Value::String("hello".into())).unwrap();
        dm.set_attribute(&root, "count", Value::Int32(7)).unwrap();
        dm.set_attribute(&root, "scale", Value::Float32(1.5)).unwrap();
        let child = dm.create_element("DmElement", "child", None).unwrap();
        dm.set_attribute(&root, "child", Value::Element(Some(child.clone()))).unwrap();
        dm.set_attribute(&child, "parent", Value::Element(Some(root.clone()))).unwrap();
        root
    }

    fn roundtrip(version: i32) -> Datamodel {
        let dm = Datamodel::new("model", 1);
        populate(&dm);

        let mut buf = Vec::new();
        let header = Header::new("binary", version, "model", 1);
        buf.extend(header.to_line().as_bytes());
        let codec = BinaryCodec::new(version);
        codec.encode(&dm, &mut buf, 1).unwrap();

        let loaded_header = Header::sniff(&buf).unwrap();
        std::rc::Rc::new(BinaryCodec::new(version)).decode(buf, &loaded_header, DeferredMode::Automatic).unwrap()
    }

    #[test]
    fn v5_roundtrips_scalars_and_cyclic_references() {
        let loaded = roundtrip(5);
        let root = loaded.root().unwrap();
        assert!(matches!(root.borrow_mut().get_attribute("name").unwrap(), Value::String(s) if s == "hello"));

        let child = match root.borrow_mut().get_attribute("child").unwrap() {
            Value::Element(Some(handle)) => handle,
            _ => panic!("expected element"),
        };
        match child.borrow_mut().get_attribute("parent").unwrap() {
            Value::Element(Some(handle)) => assert!(crate::element::same_element(&handle, &root)),
            _ => panic!("expected element"),
        }
    }

    #[test]
    fn v1_rejects_timespan() {
        let dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmElement", "root", None).unwrap();
        dm.set_root(&root).unwrap();
        dm.set_attribute(&root, "t", Value::TimeSpan(chrono::Duration::seconds(1))).unwrap();

        let codec = BinaryCodec::new(1);
        let mut buf = Vec::new();
        assert!(matches!(codec.encode(&dm, &mut buf, 1), Err(Error::AttributeType { .. })));
    }

    #[test]
    fn large_array_defers_and_materializes_once() {
        let dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmElement", "root", None).unwrap();
        dm.set_root(&root).unwrap();
        let big: Vec<i32> = (0..64).collect();
        dm.set_attribute(&root, "data", Value::Int32Array(big.clone())).unwrap();

        let mut buf = Vec::new();
        let header = Header::new("binary", 5, "model", 1);
        buf.extend(header.to_line().as_bytes());
        BinaryCodec::new(5).encode(&dm, &mut buf, 1).unwrap();

        let loaded_header = Header::sniff(&buf).unwrap();
        let loaded = std::rc::Rc::new(BinaryCodec::new(5)).decode(buf, &loaded_header, DeferredMode::Always).unwrap();
        let root = loaded.root().unwrap();
        assert!(root.borrow().attribute("data").unwrap().is_deferred());
        let value = root.borrow_mut().get_attribute("data").unwrap();
        assert!(matches!(value, Value::Int32Array(items) if items == big));
        assert!(!root.borrow().attribute("data").unwrap().is_deferred());
    }
}
