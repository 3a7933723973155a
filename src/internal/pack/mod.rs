//! Pack file decoder and encoder that follow the
//! [pack-format spec](https://git-scm.com/docs/pack-format): v2 header
//! parsing, per-entry varint headers, zlib bodies, OFS/REF delta resolution,
//! and trailer verification on the way in; non-delta entries on the way out.

pub mod decode;
pub mod encode;
pub mod entry;

/// Pack stream magic.
pub const PACK_MAGIC: &[u8; 4] = b"PACK";
/// The only input pack version the decoder accepts.
pub const PACK_VERSION: u32 = 2;

#[cfg(test)]
pub(crate) mod tests {
    use tracing_subscriber::util::SubscriberInitExt;

    /// Shared test logger; safe to call from multiple tests.
    pub(crate) fn init_logger() {
        let _ = tracing_subscriber::fmt::Subscriber::builder()
            .with_target(false)
            .without_time()
            .with_level(true)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
            .try_init(); // avoid multi-init
    }
}
