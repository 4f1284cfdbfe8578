// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing and notarization of Darwin Mach-O binaries.
//!
//! This crate produces code signatures for Mach-O binaries (thin and
//! universal) without requiring an Apple operating system or Apple's tools.
//! The Mach-O file format itself is handled by the `darwin-macho` crate.
//!
//! # Features and Capabilities
//!
//! * Ad-hoc signatures, holding only a Code Directory of page digests.
//! * Certificate signatures, adding a CMS signature made with a key and
//!   certificate chain loaded from a PKCS#12 container (see
//!   [SigningIdentity]). Time-stamp tokens are requested from a Time-Stamp
//!   Protocol server when configured.
//! * Checking the signing certificate chain for completeness before any
//!   network activity (see [chain_policy]).
//! * Embedding entitlements XML and pre-compiled requirement bytes.
//! * Submitting signed binaries to Apple's Notary API and waiting on the
//!   verdict (see [notarization]).
//! * Describing the structure and signature of binaries (see [reader]).
//!
//! Some features are out of reach:
//!
//! * Bundles, installers and disk images are not signed. Only Mach-O files.
//! * The Code Signing Requirements language is not compiled. Pass compiled
//!   requirement bytes instead.
//! * Signatures are not verified beyond what describing a binary reports.
//! * Notarization tickets are not stapled.
//!
//! # Signing
//!
//! [UnifiedSigner] signs a file on disk in place. For lower level control,
//! [MachOSigner] signs Mach-O data in memory. Both are driven by
//! [SigningSettings].

pub mod app_store_connect;
pub mod chain_policy;
pub mod clock;
pub mod code_directory;
mod code_hash;
pub mod config;
pub mod cryptography;
pub mod embedded_signature;
pub mod embedded_signature_builder;
mod error;
pub use error::*;
pub mod macho;
pub use macho::MachOSignable;
pub mod macho_signing;
pub use macho_signing::MachOSigner;
pub mod notarization;
pub mod reader;
mod signing;
pub use signing::*;
pub mod signing_identity;
pub use signing_identity::SigningIdentity;
pub mod signing_settings;
pub use signing_settings::SigningSettings;
