// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Page digests over signed binary content.

A code signature carries a digest of every page of the signed file range.
The loader verifies each page against its digest as it is paged in, so the
page boundaries here must match the page size recorded in the code
directory exactly.
*/

use crate::{embedded_signature::DigestType, error::DarwinCodesignError};

/// Compute paged digests.
///
/// `data` is split into `page_size` chunks (the last one possibly short) and
/// each chunk is digested in offset order.
pub fn paged_digests(
    data: &[u8],
    hash: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, DarwinCodesignError> {
    if page_size == 0 {
        return Err(DarwinCodesignError::SignatureBuilder("page size must be non-zero"));
    }

    data.chunks(page_size)
        .map(|chunk| hash.digest_data(chunk))
        .collect::<Result<Vec<_>, DarwinCodesignError>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_counts() {
        let data = vec![7u8; 4096 * 3 + 1];

        for (len, expected) in [(0, 0), (1, 1), (4096, 1), (4097, 2), (data.len(), 4)] {
            let digests = paged_digests(&data[..len], DigestType::Sha256, 4096).unwrap();
            assert_eq!(digests.len(), expected, "length {}", len);
        }
    }

    #[test]
    fn flipping_a_byte_changes_one_digest() {
        let mut data = (0..20000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>();
        let before = paged_digests(&data, DigestType::Sha256, 4096).unwrap();

        data[4096 * 2 + 17] ^= 0xff;
        let after = paged_digests(&data, DigestType::Sha256, 4096).unwrap();

        let changed = before
            .iter()
            .zip(after.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        assert_eq!(changed, vec![2]);
    }

    #[test]
    fn zero_page_size() {
        assert!(paged_digests(b"abc", DigestType::Sha256, 0).is_err());
    }
}
