use std::{collections::HashMap, hash::BuildHasher};

/// Manufacturer id under which compatible firmware advertises its signature.
///
/// 0xFFFF is the company id reserved for testing and unassigned use.
pub const COMPATIBLE_MANUFACTURER_ID: u16 = 0xFFFF;

/// ASCII `BLE`, the prefix compatible firmware puts in its manufacturer data
pub const COMPATIBLE_MANUFACTURER_DATA_PREFIX: [u8; 3] = [0x42, 0x4C, 0x45];

/// Returns true if the manufacturer data begins with the expected prefix
#[must_use]
pub fn is_compatible(data: Option<&[u8]>) -> bool {
    data.is_some_and(|bytes| bytes.starts_with(&COMPATIBLE_MANUFACTURER_DATA_PREFIX))
}

/// Check the payload advertised under `manufacturer_id`
#[must_use]
pub fn is_compatible_advertisement<S: BuildHasher>(
    manufacturer_data: &HashMap<u16, Vec<u8>, S>,
    manufacturer_id: u16,
) -> bool {
    is_compatible(manufacturer_data.get(&manufacturer_id).map(Vec::as_slice))
}

/// Whether the payload under `manufacturer_id` starts with `prefix`
#[must_use]
pub fn has_manufacturer_prefix<S: BuildHasher>(
    manufacturer_data: &HashMap<u16, Vec<u8>, S>,
    manufacturer_id: u16,
    prefix: &[u8],
) -> bool {
    manufacturer_data
        .get(&manufacturer_id)
        .is_some_and(|payload| payload.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_or_short_buffers() {
        assert!(!is_compatible(None));
        assert!(!is_compatible(Some(&[])));
        assert!(!is_compatible(Some(&[0x42])));
        assert!(!is_compatible(Some(&[0x42, 0x4C])));
    }

    #[test]
    fn test_mismatch_at_each_position() {
        for position in 0..3 {
            let mut data = COMPATIBLE_MANUFACTURER_DATA_PREFIX;
            data[position] ^= 0xFF;
            assert!(!is_compatible(Some(&data)), "position {position}");
        }
    }

    #[test]
    fn test_prefix_match_ignores_trailing_bytes() {
        assert!(is_compatible(Some(&[0x42, 0x4C, 0x45])));
        assert!(is_compatible(Some(b"BLE sensor v2")));
        assert!(!is_compatible(Some(b"XBLE")));
    }

    #[test]
    fn test_advertisement_lookup_uses_manufacturer_id() {
        let mut data = HashMap::new();
        data.insert(0x0059, b"BLE".to_vec());
        assert!(!is_compatible_advertisement(&data, COMPATIBLE_MANUFACTURER_ID));

        data.insert(COMPATIBLE_MANUFACTURER_ID, b"BLE\x01".to_vec());
        assert!(is_compatible_advertisement(&data, COMPATIBLE_MANUFACTURER_ID));
    }

    #[test]
    fn test_manufacturer_prefix_lookup() {
        let data = HashMap::from([(0x0059, b"ACME-7".to_vec())]);
        assert!(has_manufacturer_prefix(&data, 0x0059, b"ACME"));
        assert!(!has_manufacturer_prefix(&data, 0x0059, b"BLE"));
        assert!(!has_manufacturer_prefix(&data, COMPATIBLE_MANUFACTURER_ID, b"ACME"));
        assert!(has_manufacturer_prefix(&data, 0x0059, &[]));
    }
}
