//! Graph reuse and input tracking for a pip-based build engine.
//!
//! Re-evaluating build specifications on every invocation is expensive.
//! This crate decides, safely, whether a previously computed pip graph
//! can be reused instead — and when only spec files changed, whether the
//! reloaded graph can be patched in place. Reusing a graph must never
//! produce a build different from re-evaluation; everything here exists
//! in service of that guarantee.
//!
//! The moving parts, roughly bottom-up:
//! - [`hash`], [`wire`], [`case`], [`fs`]: content hashing, the on-disk
//!   codec, case folding, and the filesystem funnel.
//! - [`paths`], [`mounts`], [`pips`], [`config`]: the interned data
//!   model a graph is built from.
//! - [`fingerprint`]: the composite fingerprint identifying a would-be
//!   graph before evaluation begins.
//! - [`tracker`], [`journal`]: recording and verifying every
//!   graph-construction input.
//! - [`bundle`], [`cache`], [`protocol`], [`patch`]: the serialized
//!   bundle, the content cache, the three-tier lookup, and partial
//!   reuse.
//! - [`sideband`], [`carry`], [`lock`], [`ledger`], [`engine`]: the
//!   surrounding machinery of an invocation.

pub mod bundle;
pub mod cache;
pub mod carry;
pub mod case;
pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod fs;
pub mod hash;
pub mod journal;
pub mod ledger;
pub mod lock;
pub mod mounts;
pub mod patch;
pub mod paths;
pub mod pips;
pub mod protocol;
pub mod sideband;
pub mod tracker;
pub mod wire;
