//! Conditional-token id derivation.
//!
//! Outcome-token ids are deterministic: `collectionId = keccak(parent ‖
//! conditionId ‖ indexSet)` and `tokenId = keccak(collateral ‖
//! collectionId)`, with indexSet 1 = YES and 2 = NO.

use alloy_primitives::{keccak256, Address, B256, U256};

pub const INDEX_SET_YES: u32 = 1;
pub const INDEX_SET_NO: u32 = 2;

pub fn collection_id(parent: B256, condition_id: B256, index_set: u32) -> B256 {
    let mut buf = [0u8; 96];
    buf[..32].copy_from_slice(parent.as_slice());
    buf[32..64].copy_from_slice(condition_id.as_slice());
    buf[64..96].copy_from_slice(&U256::from(index_set).to_be_bytes::<32>());
    keccak256(buf)
}

/// Token id for one side of a condition, packed-encoding the collateral
/// address ahead of the collection id.
pub fn position_id(collateral: Address, collection: B256) -> U256 {
    let mut buf = [0u8; 52];
    buf[..20].copy_from_slice(collateral.as_slice());
    buf[20..].copy_from_slice(collection.as_slice());
    U256::from_be_bytes(keccak256(buf).0)
}

/// (YES, NO) token ids for a condition, as canonical hex strings.
pub fn outcome_token_ids(collateral: Address, condition_id: B256) -> (String, String) {
    let yes = position_id(
        collateral,
        collection_id(B256::ZERO, condition_id, INDEX_SET_YES),
    );
    let no = position_id(
        collateral,
        collection_id(B256::ZERO, condition_id, INDEX_SET_NO),
    );
    (u256_hex(yes), u256_hex(no))
}

/// Canonical token-id form: lowercase 0x-prefixed, 64 hex digits.
pub fn u256_hex(v: U256) -> String {
    format!("0x{}", hex::encode(v.to_be_bytes::<32>()))
}

pub fn parse_b256(s: &str) -> Option<B256> {
    let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(B256::from_slice(&bytes))
}

pub fn parse_address(s: &str) -> Option<Address> {
    let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    Some(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue_token_id(collateral: Address, condition_id: B256, index_set: u32) -> String {
        // Independent recomputation of the venue's published derivation.
        let mut coll = Vec::with_capacity(96);
        coll.extend_from_slice(&[0u8; 32]);
        coll.extend_from_slice(condition_id.as_slice());
        coll.extend_from_slice(&U256::from(index_set).to_be_bytes::<32>());
        let collection = keccak256(&coll);

        let mut pos = Vec::with_capacity(52);
        pos.extend_from_slice(collateral.as_slice());
        pos.extend_from_slice(collection.as_slice());
        format!("0x{}", hex::encode(keccak256(&pos)))
    }

    #[test]
    fn token_id_round_trip() {
        let collateral = parse_address(crate::models::USDC_ADDRESS).unwrap();
        let condition_id = parse_b256(
            "0x00000000000000000000000000000000000000000000000000000000000000aa",
        )
        .unwrap();

        let (yes, no) = outcome_token_ids(collateral, condition_id);
        assert_eq!(yes, venue_token_id(collateral, condition_id, INDEX_SET_YES));
        assert_eq!(no, venue_token_id(collateral, condition_id, INDEX_SET_NO));
        assert_ne!(yes, no);
        assert_eq!(yes.len(), 66);
    }

    #[test]
    fn distinct_conditions_yield_distinct_ids() {
        let collateral = parse_address(crate::models::USDC_ADDRESS).unwrap();
        let a = parse_b256("0x0000000000000000000000000000000000000000000000000000000000000001")
            .unwrap();
        let b = parse_b256("0x0000000000000000000000000000000000000000000000000000000000000002")
            .unwrap();
        assert_ne!(outcome_token_ids(collateral, a), outcome_token_ids(collateral, b));
    }

    #[test]
    fn parse_helpers_reject_bad_lengths() {
        assert!(parse_b256("0x1234").is_none());
        assert!(parse_address("0x1234").is_none());
        assert!(parse_address(crate::models::USDC_ADDRESS).is_some());
    }
}
