/// TON encodings consumed by the purchase flow.
use crate::types::{TransactionIdentity, TransactionReceipt};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use thiserror::Error;

pub mod address;
pub mod boc;

pub use address::{AddressError, TonAddress, normalize_address};
pub use boc::{BagOfCells, BocError};

/// The wallet returned a receipt that is not a usable bag of cells.
///
/// Retrying with the same blob cannot succeed, so this ends the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed transaction receipt: {0}")]
pub struct MalformedReceipt(#[from] pub BocError);

/// Derives the canonical transaction identity from a signed receipt.
///
/// The identity is the representation hash of the root cell, which does not
/// change when the blob is re-serialized with other flags or alphabets.
pub fn extract_identity(
    receipt: &TransactionReceipt,
) -> Result<TransactionIdentity, MalformedReceipt> {
    let boc = BagOfCells::from_base64(&receipt.boc)?;
    Ok(TransactionIdentity::from_hash(boc.root_hash()))
}

/// Decodes base64 in either alphabet, with or without padding.
pub(crate) fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = input.trim().trim_end_matches('=');
    if trimmed.contains(['-', '_']) {
        URL_SAFE_NO_PAD.decode(trimmed)
    } else {
        STANDARD_NO_PAD.decode(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_CELL_HASH: &str =
        "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7";

    fn receipt(boc: &str) -> TransactionReceipt {
        TransactionReceipt {
            boc: boc.to_string(),
        }
    }

    #[test]
    fn identity_is_deterministic() {
        let receipt = receipt("te6cckEBAQEAAgAAAEysuc0=");
        let first = extract_identity(&receipt).unwrap();
        let second = extract_identity(&receipt).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), EMPTY_CELL_HASH);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn identity_ignores_serialization_flags_and_alphabet() {
        // same cell serialized without crc, without padding, and url-safe
        let plain = extract_identity(&receipt("te6ccgEBAQEAAgAAAA==")).unwrap();
        let unpadded = extract_identity(&receipt("te6ccgEBAQEAAgAAAA")).unwrap();
        let tree_std = extract_identity(&receipt("te6ccsEBAgEACgAHCgEI3q2+7wEAAaiy6G8O")).unwrap();
        let tree_url = extract_identity(&receipt("te6ccsEBAgEACgAHCgEI3q2-7wEAAaiy6G8O")).unwrap();
        assert_eq!(plain.as_str(), EMPTY_CELL_HASH);
        assert_eq!(plain, unpadded);
        assert_eq!(tree_std, tree_url);
    }

    #[test]
    fn malformed_receipts_fail_with_structured_error() {
        for boc in ["", "!!!not base64!!!", "te6cckEBAQEAAgAAAE", "aGVsbG8gd29ybGQ="] {
            let result = extract_identity(&receipt(boc));
            assert!(matches!(result, Err(MalformedReceipt(_))), "input {boc:?}");
        }
    }

    #[test]
    fn receipt_with_several_roots_is_malformed() {
        let result = extract_identity(&receipt("te6ccgEBAgIABAABAAAAAA=="));
        assert!(matches!(
            result,
            Err(MalformedReceipt(BocError::InvalidHeader(_)))
        ));
    }
}
