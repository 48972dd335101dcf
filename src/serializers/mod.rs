//! Concrete [`crate::Codec`] implementations and their default-registry
//! wiring.

pub mod binary;
pub mod keyvalues2;

pub use binary::BinaryCodec;
pub use keyvalues2::KeyValues2Codec;

/// Registers every codec this crate ships under its `(encoding, version)`
/// key. Called lazily on first [`crate::Datamodel::save`]/[`crate::Datamodel::load`]
/// rather than at startup, so a caller that never touches I/O never pays
/// for it (spec §6, "codec registry").
pub(crate) fn register_defaults() {
    crate::codec::register_codec("binary", 1, binary::factory_v1);
    crate::codec::register_codec("binary", 2, binary::factory_v2);
    crate::codec::register_codec("binary", 3, binary::factory_v3);
    crate::codec::register_codec("binary", 4, binary::factory_v4);
    crate::codec::register_codec("binary", 5, binary::factory_v5);
    crate::codec::register_codec("keyvalues2", 1, keyvalues2::factory_v1);
}
