use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;
use tapd_consensus::Hash256;

pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(sha256(data)).into()
}

/// Hex in display order (byte-reversed), as txids and block hashes are shown.
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn hash_from_hex(hex: &str) -> Option<Hash256> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).ok()?;
        out[31 - i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        assert_eq!(
            hash_to_hex(&sha256d(b"")),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn hex_round_trip_is_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        let hex = hash_to_hex(&hash);
        assert!(hex.ends_with("ab"));
        assert_eq!(hash_from_hex(&hex), Some(hash));
        assert_eq!(hash_from_hex("zz"), None);
    }
}
