//! CRC16-XMODEM as used by Redis Cluster key hashing
//!
//! Polynomial 0x1021, initial value 0, no reflection. The 256-entry lookup
//! table is generated at compile time.
//!
//! Test vector: `crc16(b"123456789") == 0x31C3`.

const POLY: u16 = 0x1021;

const CRC16_TAB: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Calculate the CRC16 checksum of `data`
///
/// ```
/// use phloem_protocol::crc16::crc16;
///
/// assert_eq!(crc16(b"123456789"), 0x31C3);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let idx = ((crc >> 8) ^ byte as u16) & 0xFF;
        (crc << 8) ^ CRC16_TAB[idx as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_empty_input_is_initial_value() {
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn test_table_spot_values() {
        assert_eq!(CRC16_TAB[0], 0x0000);
        assert_eq!(CRC16_TAB[1], 0x1021);
        assert_eq!(CRC16_TAB[2], 0x2042);
        assert_eq!(CRC16_TAB[16], 0x1231);
        assert_eq!(CRC16_TAB[255], 0x1ef0);
    }

    #[test]
    fn test_case_sensitive() {
        assert_ne!(crc16(b"test"), crc16(b"Test"));
    }

    #[test]
    fn test_binary_input() {
        let binary = [0x00, 0xFF, 0xAA, 0x55];
        assert_eq!(crc16(&binary), crc16(&binary.to_vec()));
        assert_ne!(crc16(&binary), crc16(&[0x00, 0xFF, 0xAA]));
    }
}
