//! Keyvalues2 encoding, version 1: a human-readable text form.
//!
//! Grounded in the teacher's `serializers/keyvalues2.rs` (quoted
//! `"key" "value"` pairs, brace-delimited blocks, a hand-rolled
//! line/column-tracking tokenizer) but redesigned around this crate's own
//! value model rather than the teacher's (incompatible, dead) attribute
//! types — see `DESIGN.md`.
//!
//! Body shape (everything after the header line), one block per element
//! this datamodel owns directly (stubs are never given a block — only
//! referenced by id from elsewhere):
//! ```text
//! "<class_name>" "<element_name>"
//! {
//!     "id" "elementid" "<guid>"
//!     "<attr_name>" "<kind>" "<value>"
//!     "<attr_name>" "<kind>" [ "<value>", "<value>" ]
//! }
//! ```
//! As with the binary form, every block's id is read before any attribute
//! is parsed, so forward, backward, and cyclic element references all
//! resolve against an already-populated registry.

use std::fmt::Write as _;

use uuid::Uuid;

use crate::codec::{Codec, DeferredMode, Header};
use crate::datamodel::Datamodel;
use crate::element::ElementHandle;
use crate::element_array::ElementArray;
use crate::error::Error;
use crate::value::{Value, Vector3};

const ATTRIBUTE_VERSION: i32 = 2;

pub struct KeyValues2Codec;

impl KeyValues2Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KeyValues2Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for KeyValues2Codec {
    fn encoding_name(&self) -> &'static str {
        "keyvalues2"
    }

    fn encoding_version(&self) -> i32 {
        1
    }

    fn encode(&self, datamodel: &Datamodel, sink: &mut dyn std::io::Write, _format_version: i32) -> Result<(), Error> {
        let mut out = String::new();
        write_datamodel(datamodel, &mut out)?;
        sink.write_all(out.as_bytes())?;
        Ok(())
    }

    fn decode(self: std::rc::Rc<Self>, source: Vec<u8>, header: &Header, _deferred_mode: DeferredMode) -> Result<Datamodel, Error> {
        let header_end = source.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(0);
        let text = String::from_utf8(source[header_end..].to_vec()).map_err(|e| Error::UnsupportedFormat(format!("keyvalues2 body is not valid utf-8: {e}")))?;

        let datamodel = Datamodel::new(header.format.clone(), header.format_version);
        let tokens = lex(&text)?;
        let mut parser = Parser { tokens: &tokens, pos: 0 };
        let blocks = parser.parse_blocks()?;
        populate_datamodel(&datamodel, blocks)?;
        Ok(datamodel)
    }

    /// Text form never defers — every value is inline by construction.
    fn deferred_decode_attribute(&self, _offset: u64) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        Err(Box::new(Error::InvalidOperation("keyvalues2 never produces deferred attributes".into())))
    }
}

pub(crate) fn factory_v1() -> std::rc::Rc<dyn Codec> {
    std::rc::Rc::new(KeyValues2Codec::new())
}

// ------------------------------------------------------------- encoding

fn write_datamodel(datamodel: &Datamodel, out: &mut String) -> Result<(), Error> {
    for element in datamodel.all_elements() {
        if element.borrow().is_stub() {
            continue;
        }
        write_block(&element, out)?;
    }
    Ok(())
}

fn write_block(element: &ElementHandle, out: &mut String) -> Result<(), Error> {
    let element_ref = element.borrow();
    writeln!(out, "{} {}", quote(element_ref.class_name()), quote(element_ref.name())).unwrap();
    out.push_str("{\n");
    writeln!(out, "\t\"id\" \"elementid\" {}", quote(&element_ref.id().to_string())).unwrap();

    let names: Vec<String> = element_ref.attributes().map(|(name, _)| name.to_string()).collect();
    drop(element_ref);

    for name in names {
        let value = element.borrow_mut().get_attribute(&name)?;
        write_attribute(&name, &value, out)?;
    }

    out.push_str("}\n");
    Ok(())
}

fn write_attribute(name: &str, value: &Value, out: &mut String) -> Result<(), Error> {
    if matches!(value, Value::TimeSpan(_) | Value::TimeSpanArray(_)) && ATTRIBUTE_VERSION < 2 {
        return Err(Error::AttributeType { name: value.kind_name().to_string() });
    }

    match value {
        Value::Element(handle) => {
            let id = handle.as_ref().map(|h| h.borrow().id().to_string()).unwrap_or_default();
            writeln!(out, "\t{} \"element\" {}", quote(name), quote(&id)).unwrap();
        }
        Value::ElementArray(array) => {
            let ids: Vec<String> = array.iter().map(|item| item.as_ref().map(|h| h.borrow().id().to_string()).unwrap_or_default()).collect();
            writeln!(out, "\t{} \"element_array\" {}", quote(name), quote_array(&ids)).unwrap();
        }
        _ => {
            let kind = value.kind_name();
            if value.is_array() {
                let rendered = render_array(value)?;
                writeln!(out, "\t{} {} {}", quote(name), quote(kind), quote_array(&rendered)).unwrap();
            } else {
                let rendered = render_scalar(value)?;
                writeln!(out, "\t{} {} {}", quote(name), quote(kind), quote(&rendered)).unwrap();
            }
        }
    }
    Ok(())
}

fn render_scalar(value: &Value) -> Result<String, Error> {
    Ok(match value {
        Value::Int32(v) => v.to_string(),
        Value::Float32(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Binary(v) => hex_encode(v),
        Value::TimeSpan(v) => v.num_microseconds().unwrap_or(0).to_string(),
        Value::Color(v) => v.to_string(),
        Value::Vector2(v) => v.to_string(),
        Value::Vector3(v) => v.to_string(),
        Value::Vector4(v) => v.to_string(),
        Value::Angle(v) => v.to_string(),
        Value::Quaternion(v) => v.to_string(),
        Value::Matrix4(v) => v.to_string(),
        other => return Err(Error::AttributeType { name: other.kind_name().to_string() }),
    })
}

fn render_array(value: &Value) -> Result<Vec<String>, Error> {
    Ok(match value {
        Value::Int32Array(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::Float32Array(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::BoolArray(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::StringArray(items) => items.clone(),
        Value::BinaryArray(items) => items.iter().map(|v| hex_encode(v)).collect(),
        Value::TimeSpanArray(items) => items.iter().map(|v| v.num_microseconds().unwrap_or(0).to_string()).collect(),
        Value::ColorArray(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::Vector2Array(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::Vector3Array(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::Vector4Array(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::AngleArray(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::QuaternionArray(items) => items.iter().map(|v| v.to_string()).collect(),
        Value::Matrix4Array(items) => items.iter().map(|v| v.to_string()).collect(),
        other => return Err(Error::AttributeType { name: other.kind_name().to_string() }),
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        return Err(Error::UnsupportedFormat("odd-length hex string".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::UnsupportedFormat(format!("invalid hex byte {:?}", &s[i..i + 2]))))
        .collect()
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn quote_array(items: &[String]) -> String {
    let rendered: Vec<String> = items.iter().map(|s| quote(s)).collect();
    format!("[ {} ]", rendered.join(", "))
}

// ------------------------------------------------------------- decoding

#[derive(Debug, Clone, PartialEq)]
enum Token {
    String(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
}

fn lex(text: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut line = 1usize;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' => {
                line += 1;
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => i += 1,
            '/' if bytes.get(i + 1) == Some(&'/') => {
                while i < bytes.len() && bytes[i] != '\n' {
                    i += 1;
                }
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        None => return Err(Error::UnsupportedFormat(format!("line {line}: unterminated string"))),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match bytes.get(i) {
                                Some('"') => s.push('"'),
                                Some('\\') => s.push('\\'),
                                Some('n') => s.push('\n'),
                                Some(other) => s.push(*other),
                                None => return Err(Error::UnsupportedFormat(format!("line {line}: unterminated escape"))),
                            }
                            i += 1;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::String(s));
            }
            other => return Err(Error::UnsupportedFormat(format!("line {line}: unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

struct ParsedAttribute {
    name: String,
    kind: String,
    scalar: Option<String>,
    array: Option<Vec<String>>,
}

struct ParsedBlock {
    class_name: String,
    element_name: String,
    id: Uuid,
    attributes: Vec<ParsedAttribute>,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_blocks(&mut self) -> Result<Vec<ParsedBlock>, Error> {
        let mut blocks = Vec::new();
        while self.pos < self.tokens.len() {
            blocks.push(self.parse_block()?);
        }
        Ok(blocks)
    }

    fn parse_block(&mut self) -> Result<ParsedBlock, Error> {
        let class_name = self.expect_string()?;
        let element_name = self.expect_string()?;
        self.expect(Token::LBrace)?;

        let mut attributes = Vec::new();
        let mut id = None;
        loop {
            if self.peek() == Some(&Token::RBrace) {
                self.pos += 1;
                break;
            }
            let name = self.expect_string()?;
            let kind = self.expect_string()?;
            if name == "id" && kind == "elementid" {
                let raw = self.expect_string()?;
                id = Some(Uuid::parse_str(&raw).map_err(|e| Error::UnsupportedFormat(format!("invalid element id {raw:?}: {e}")))?);
                continue;
            }

            if self.peek() == Some(&Token::LBracket) {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek() != Some(&Token::RBracket) {
                    items.push(self.expect_string()?);
                }
                self.pos += 1;
                attributes.push(ParsedAttribute { name, kind, scalar: None, array: Some(items) });
            } else {
                let value = self.expect_string()?;
                attributes.push(ParsedAttribute { name, kind, scalar: Some(value), array: None });
            }
        }

        Ok(ParsedBlock { class_name, element_name, id: id.unwrap_or_else(Uuid::new_v4), attributes })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expect(&mut self, expected: Token) -> Result<(), Error> {
        match self.tokens.get(self.pos) {
            Some(tok) if *tok == expected => {
                self.pos += 1;
                Ok(())
            }
            other => Err(Error::UnsupportedFormat(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn expect_string(&mut self) -> Result<String, Error> {
        match self.tokens.get(self.pos) {
            Some(Token::String(s)) => {
                self.pos += 1;
                Ok(s.clone())
            }
            other => Err(Error::UnsupportedFormat(format!("expected a quoted string, found {other:?}"))),
        }
    }
}

fn populate_datamodel(datamodel: &Datamodel, blocks: Vec<ParsedBlock>) -> Result<(), Error> {
    let mut handles = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let element = match datamodel.element(block.id) {
            Some(existing) => existing,
            None => datamodel.create_element(block.class_name.clone(), block.element_name.clone(), Some(block.id))?,
        };
        handles.push(element);
    }

    if let Some(root) = handles.first() {
        datamodel.set_root(root)?;
    }

    for (block, element) in blocks.into_iter().zip(handles.into_iter()) {
        for attribute in block.attributes {
            let value = parse_value(datamodel, &attribute)?;
            datamodel.set_attribute(&element, attribute.name, value)?;
        }
    }

    Ok(())
}

fn parse_value(datamodel: &Datamodel, attribute: &ParsedAttribute) -> Result<Value, Error> {
    match attribute.kind.as_str() {
        "element" => {
            let raw = attribute.scalar.as_deref().unwrap_or_default();
            Ok(Value::Element(resolve(datamodel, raw)?))
        }
        "element_array" => {
            let items = attribute.array.as_deref().unwrap_or_default();
            let mut resolved = Vec::with_capacity(items.len());
            for raw in items {
                resolved.push(resolve(datamodel, raw)?);
            }
            Ok(Value::ElementArray(ElementArray::from_vec(resolved)))
        }
        kind => {
            if let Some(items) = &attribute.array {
                parse_array(kind, items)
            } else {
                let raw = attribute.scalar.as_deref().unwrap_or_default();
                parse_scalar(kind, raw)
            }
        }
    }
}

fn resolve(datamodel: &Datamodel, raw: &str) -> Result<Option<ElementHandle>, Error> {
    if raw.is_empty() {
        return Ok(None);
    }
    let id = Uuid::parse_str(raw).map_err(|e| Error::UnsupportedFormat(format!("invalid element reference {raw:?}: {e}")))?;
    Ok(Some(datamodel.element(id).unwrap_or_else(|| datamodel.stub_for(id))))
}

fn parse_scalar(kind: &str, raw: &str) -> Result<Value, Error> {
    Ok(match kind {
        "int" => Value::Int32(raw.parse()?),
        "float" => Value::Float32(raw.parse()?),
        "bool" => Value::Bool(raw.parse().map_err(|_| Error::ValueDomain(format!("not a bool: {raw:?}")))?),
        "string" => Value::String(raw.to_string()),
        "binary" => Value::Binary(hex_decode(raw)?),
        "time" => Value::TimeSpan(chrono::Duration::microseconds(raw.parse()?)),
        "color" => Value::Color(raw.parse()?),
        "vector2" => Value::Vector2(raw.parse()?),
        "vector3" => Value::Vector3(raw.parse()?),
        "vector4" => Value::Vector4(raw.parse()?),
        "qangle" => Value::Angle(raw.parse()?),
        "quaternion" => Value::Quaternion(raw.parse()?),
        "matrix" => Value::Matrix4(raw.parse()?),
        other => return Err(Error::UnsupportedFormat(format!("unknown attribute kind {other:?}"))),
    })
}

fn parse_array(kind: &str, items: &[String]) -> Result<Value, Error> {
    Ok(match kind {
        "int_array" => Value::Int32Array(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "float_array" => Value::Float32Array(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "bool_array" => {
            let mut out = Vec::with_capacity(items.len());
            for s in items {
                out.push(s.parse().map_err(|_| Error::ValueDomain(format!("not a bool: {s:?}")))?);
            }
            Value::BoolArray(out)
        }
        "string_array" => Value::StringArray(items.to_vec()),
        "binary_array" => Value::BinaryArray(items.iter().map(|s| hex_decode(s)).collect::<Result<_, _>>()?),
        "time_array" => Value::TimeSpanArray(items.iter().map(|s| s.parse().map(chrono::Duration::microseconds)).collect::<Result<_, _>>()?),
        "color_array" => Value::ColorArray(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "vector2_array" => Value::Vector2Array(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "vector3_array" => Value::Vector3Array(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "vector4_array" => Value::Vector4Array(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "qangle_array" => Value::AngleArray(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "quaternion_array" => Value::QuaternionArray(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        "matrix_array" => Value::Matrix4Array(items.iter().map(|s| s.parse()).collect::<Result<_, _>>()?),
        other => return Err(Error::UnsupportedFormat(format!("unknown attribute array kind {other:?}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(dm: &Datamodel) -> Datamodel {
        let mut buf = Vec::new();
        let header = Header::new("keyvalues2", 1, "model", 1);
        buf.extend(header.to_line().as_bytes());
        KeyValues2Codec::new().encode(dm, &mut buf, 1).unwrap();

        let loaded_header = Header::sniff(&buf).unwrap();
        std::rc::Rc::new(KeyValues2Codec::new()).decode(buf, &loaded_header, DeferredMode::Disabled).unwrap()
    }

    #[test]
    fn roundtrips_scalars_and_timespan() {
        let dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmElement", "root", None).unwrap();
        dm.set_root(&root).unwrap();
        dm.set_attribute(&root, "name", Value::String("hello world".into())).unwrap();
        dm.set_attribute(&root, "elapsed", Value::TimeSpan(chrono::Duration::milliseconds(1500))).unwrap();
        dm.set_attribute(&root, "scale", Value::Vector3(Vector3 { x: 1.0, y: 2.0, z: 3.0 })).unwrap();

        let loaded = roundtrip(&dm);
        let loaded_root = loaded.root().unwrap();

        assert!(matches!(loaded_root.borrow_mut().get_attribute("name").unwrap(), Value::String(s) if s == "hello world"));

        match loaded_root.borrow_mut().get_attribute("elapsed").unwrap() {
            Value::TimeSpan(d) => assert_eq!(d.num_milliseconds(), 1500),
            _ => panic!("expected time"),
        }
    }

    #[test]
    fn roundtrips_cyclic_element_references() {
        let dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmElement", "root", None).unwrap();
        dm.set_root(&root).unwrap();
        let child = dm.create_element("DmElement", "child", None).unwrap();
        dm.set_attribute(&root, "child", Value::Element(Some(child.clone()))).unwrap();
        dm.set_attribute(&child, "parent", Value::Element(Some(root.clone()))).unwrap();

        let loaded = roundtrip(&dm);
        let loaded_root = loaded.root().unwrap();
        let loaded_child = match loaded_root.borrow_mut().get_attribute("child").unwrap() {
            Value::Element(Some(h)) => h,
            _ => panic!("expected element"),
        };
        match loaded_child.borrow_mut().get_attribute("parent").unwrap() {
            Value::Element(Some(h)) => assert!(crate::element::same_element(&h, &loaded_root)),
            _ => panic!("expected element"),
        }
    }

    #[test]
    fn lexer_rejects_unterminated_string() {
        assert!(lex("\"DmElement\" \"root\"\n{\n\t\"id\" \"elementid\" \"abc").is_err());
    }
}
