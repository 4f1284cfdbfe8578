// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Errors raised when reading, mutating, or writing Mach-O data.
#[derive(Debug, Error)]
pub enum MachOError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("malformed Mach-O binary: {0}")]
    MalformedBinary(String),

    #[error("insufficient room to write load command")]
    LoadCommandNoRoom,

    #[error("load command index out of range: {0}")]
    LoadCommandIndex(usize),

    #[error("unable to locate segment {0}")]
    SegmentNotFound(String),

    #[error("resizing segment {0} would overlap the following segment")]
    SegmentOverlap(String),

    #[error("section data does not lie within segment {0}")]
    SectionOutsideSegment(String),

    #[error("write of {1} bytes at offset {0} is out of bounds")]
    WriteOutOfBounds(usize, usize),

    #[error("offset or size exceeds the range of the binary's offset fields")]
    InsufficientSpace,

    #[error("too many architectures for universal binary header")]
    TooManyArchitectures,
}

impl MachOError {
    pub(crate) fn malformed(message: impl ToString) -> Self {
        Self::MalformedBinary(message.to_string())
    }
}
