//! The contract between [`crate::Datamodel`] and a pluggable wire-format
//! encoder/decoder, and the process-wide registry codecs are looked up
//! through.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};

use crate::datamodel::Datamodel;
use crate::error::Error;
use crate::value::Value;

/// How eagerly a decode should materialize attribute values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredMode {
    /// The codec must materialize everything eagerly.
    Disabled,
    /// The codec may defer large/expensive values at its own discretion.
    Automatic,
    /// The codec must defer whatever it is able to.
    Always,
}

/// A pluggable encoder/decoder for one `(encoding, version)` wire form.
///
/// Implementations are registered under their `(name, version)` key via
/// [`register_codec`] and looked up by [`crate::Datamodel::save`] /
/// [`crate::Datamodel::load`]. `decode` takes `self: Rc<Self>` so the
/// resulting datamodel (and any deferred attribute it installs) can hold a
/// clone of the very codec instance that parsed it.
pub trait Codec {
    /// The encoding name as it appears in the header line, e.g. `"binary"`.
    fn encoding_name(&self) -> &'static str;

    /// The encoding version this instance speaks.
    fn encoding_version(&self) -> i32;

    /// A short identifier used in [`Error::Codec`] messages.
    fn identity(&self) -> String {
        format!("{}/{}", self.encoding_name(), self.encoding_version())
    }

    fn encode(&self, datamodel: &Datamodel, sink: &mut dyn std::io::Write, format_version: i32) -> Result<(), Error>;

    fn decode(self: Rc<Self>, source: Vec<u8>, header: &Header, deferred_mode: DeferredMode) -> Result<Datamodel, Error>;

    /// Decodes exactly one attribute value found at `offset` in the source
    /// this codec was constructed from. Only scalar or scalar-array kinds
    /// may appear here — the bulk section of the wire forms never carries
    /// element references (spec §6). Safe under concurrent callers on
    /// distinct offsets; implementations serialize internally via their own
    /// lock (spec §5, "codec lock").
    fn deferred_decode_attribute(&self, offset: u64) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>;

    /// Releases any stream/buffer this codec holds. A disposed codec must
    /// fail further [`Codec::deferred_decode_attribute`] calls (spec §5,
    /// "resource lifecycle").
    fn dispose(&self) {}

    fn is_disposed(&self) -> bool {
        false
    }
}

/// Factory for a codec instance bound to a decode in progress, or a fresh
/// encoder instance. Concrete codecs expose their own constructors;
/// `RegisterCodec` only needs a zero-argument way to produce one for
/// dispatch.
pub type CodecFactory = fn() -> Rc<dyn Codec>;

#[derive(Hash, Eq, PartialEq, Clone)]
struct CodecKey {
    encoding: String,
    version: i32,
}

static REGISTRY: OnceLock<Mutex<HashMap<CodecKey, CodecFactory>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<CodecKey, CodecFactory>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a codec factory under `(encoding, version)`. Re-registering
/// the same key replaces the previous factory.
pub fn register_codec(encoding: &str, version: i32, factory: CodecFactory) {
    registry().lock().unwrap().insert(CodecKey { encoding: encoding.to_string(), version }, factory);
}

/// Looks up a codec factory, failing with [`Error::CodecNotFound`] if none
/// is registered for this pair.
pub fn lookup_codec(encoding: &str, version: i32) -> Result<Rc<dyn Codec>, Error> {
    registry()
        .lock()
        .unwrap()
        .get(&CodecKey { encoding: encoding.to_string(), version })
        .map(|factory| factory())
        .ok_or_else(|| Error::CodecNotFound { encoding: encoding.to_string(), version })
}

pub(crate) fn ensure_default_codecs_registered() {
    crate::serializers::register_defaults();
}

/// The envelope line every supported wire form begins with (spec §6):
/// `<!-- dmx encoding <name> <version> format <tag> <version> -->`.
#[derive(Debug, Clone)]
pub struct Header {
    pub encoding_name: String,
    pub encoding_version: i32,
    pub format: String,
    pub format_version: i32,
}

impl Header {
    pub fn new(encoding_name: impl Into<String>, encoding_version: i32, format: impl Into<String>, format_version: i32) -> Self {
        Self { encoding_name: encoding_name.into(), encoding_version, format: format.into(), format_version }
    }

    pub fn to_line(&self) -> String {
        format!("<!-- dmx encoding {} {} format {} {} -->\n", self.encoding_name, self.encoding_version, self.format, self.format_version)
    }

    /// Sniffs the leading ASCII line of `source`, also accepting the legacy
    /// `<!-- DMXVersion binary_v1 -->` / `binary_v2` form the teacher crate
    /// carried forward compatibility for. Fails with
    /// [`Error::UnsupportedFormat`] on anything else, without consuming any
    /// bytes past the header (the caller hands the whole buffer to the
    /// resolved codec).
    pub fn sniff(source: &[u8]) -> Result<Self, Error> {
        let end = source.iter().position(|&b| b == b'\n').ok_or_else(|| Error::UnsupportedFormat("no header line found".into()))?;
        let line = String::from_utf8_lossy(&source[..end]);
        Self::parse(&line)
    }

    fn parse(line: &str) -> Result<Self, Error> {
        static MODERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        static LEGACY: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

        let modern = MODERN.get_or_init(|| regex::Regex::new(r"<!--\s*dmx encoding (\S+) (\d+) format (\S+) (\d+)\s*-->").unwrap());
        let legacy = LEGACY.get_or_init(|| regex::Regex::new(r"<!--\s*DMXVersion (\S+)\s*-->").unwrap());

        if let Some(caps) = modern.captures(line) {
            let encoding_version = caps[2].parse().map_err(Error::ParseInteger)?;
            let format_version = caps[4].parse().map_err(Error::ParseInteger)?;
            return Ok(Self::new(caps[1].to_string(), encoding_version, caps[3].to_string(), format_version));
        }

        if let Some(caps) = legacy.captures(line) {
            return match &caps[1] {
                "binary_v1" => Ok(Self::new("binary", 1, "dmx", 1)),
                "binary_v2" => Ok(Self::new("binary", 2, "dmx", 1)),
                other => Err(Error::UnsupportedFormat(format!("unknown legacy encoding \"{other}\""))),
            };
        }

        Err(Error::UnsupportedFormat(format!("header line does not match the dmx envelope: {line:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_modern_header() {
        let header = Header::sniff(b"<!-- dmx encoding binary 5 format model 1 -->\ntrailing").unwrap();
        assert_eq!(header.encoding_name, "binary");
        assert_eq!(header.encoding_version, 5);
        assert_eq!(header.format, "model");
        assert_eq!(header.format_version, 1);
    }

    #[test]
    fn sniffs_legacy_header() {
        let header = Header::sniff(b"<!-- DMXVersion binary_v2 -->\n").unwrap();
        assert_eq!(header.encoding_name, "binary");
        assert_eq!(header.encoding_version, 2);
    }

    #[test]
    fn rejects_unknown_header() {
        assert!(Header::sniff(b"not a header\n").is_err());
    }

    #[test]
    fn roundtrips_to_line_and_back() {
        let header = Header::new("keyvalues2", 1, "model", 3);
        let parsed = Header::sniff(format!("{}rest", header.to_line()).as_bytes()).unwrap();
        assert_eq!(parsed.encoding_name, header.encoding_name);
        assert_eq!(parsed.format, header.format);
        assert_eq!(parsed.format_version, header.format_version);
    }
}
