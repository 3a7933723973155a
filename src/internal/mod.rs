//! Git internals: the object model, pack codec, and zlib streaming that the
//! storage engine builds on.
pub mod object;
pub mod pack;
pub mod zlib;
