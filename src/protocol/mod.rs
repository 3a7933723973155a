//! Git Smart HTTP protocol glue: pkt-line framing, ref advertisement,
//! upload-pack negotiation, and receive-pack ingestion over the storage
//! engine.
pub mod smart;
pub mod types;
pub mod utils;
