// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O binary codec.

This crate parses thin and universal Mach-O binaries into an owned object
model ([MachOImage], [FatBinary]), exposes the mutations needed to embed code
signatures (inserting and replacing load commands, resizing segments,
appending sections), and writes the model back to bytes.

Parsing validates every offset and size declared by the binary against the
data it was read from. Serializing an unmodified model reproduces the input
exactly.
*/

mod error;
pub use error::MachOError;
mod fat;
pub use fat::{FatArch, FatBinary, FatSlice, MachFile, FAT_MAGIC_64};
mod header;
pub use header::{Ctx, MachHeader};
mod image;
pub use image::{parse_version_nibbles, MachOImage, MachoTarget, Platform};
pub mod load_command;
pub use load_command::{LinkeditData, LoadCommand, LoadCommandData};
mod segment;
pub use segment::{name_to_str, str_to_name, Section, Segment};
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod universal;
pub use universal::{create_universal_macho, UniversalBinaryBuilder};
