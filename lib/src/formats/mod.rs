//! Container formats shipped with the crate. Each module exposes a
//! `descriptor()` for [`crate::Registry::register`].
pub mod msi;
