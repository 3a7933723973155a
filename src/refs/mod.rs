//! Ref storage: the append-only ref log (ordering authority), the
//! materialized ref table with compare-and-swap, and branch protection.
pub mod log;
pub mod protection;
pub mod store;
