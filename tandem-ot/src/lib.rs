//! # tandem-ot — Operational Transform core for Tandem
//!
//! Pure, allocation-light building blocks for plain-text collaboration.
//! Nothing in this crate performs I/O or spawns tasks; the collaboration
//! server (`tandem-collab`) drives it from a single writer per document.
//!
//! ## Model
//!
//! ```text
//!   base document (n chars)
//!   ┌──────────────────────────────────────────┐
//!   │ retain(5) │ delete(3) │ retain(n-8)       │
//!   └──────────────────────────────────────────┘
//!                 insert("abc") ▲
//! ```
//!
//! An [`Operation`] walks the whole base document once. `retain` and
//! `delete` consume base characters, `insert` produces new ones.
//!
//! ## Modules
//!
//! - [`operation`] — segment model, builder, `apply`, `diff`
//! - [`codec`] — binary (bincode) and compact JSON forms
//! - [`transform`] — `transform`, `compose`, cursor transformation

pub mod codec;
pub mod error;
pub mod operation;
pub mod transform;

pub use codec::{decode, decode_with_limits, encode, from_json, to_json, CodecLimits};
pub use error::OtError;
pub use operation::{Component, Operation};
pub use transform::{compose, transform, transform_by_author, transform_index};
