/// Bech32 character set, used for rendering session identifiers in logs.
/// Checksum-friendly and free of visually ambiguous characters.
const BECH32_ALPHABET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Encode bytes as base32 over the bech32 alphabet, no padding.
pub fn bech32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BECH32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BECH32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Generate a short per-connection tag for log correlation.
pub fn connection_tag() -> String {
    let uuid = uuid::Uuid::new_v4();
    bech32_encode(&uuid.as_bytes()[..8])
}
