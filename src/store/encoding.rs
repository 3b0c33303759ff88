use data_encoding::BASE32_NOPAD;

/// Encodes digest bytes as lowercase hex, the printable form of the
/// `sha1new` and `sha256` formats.
pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Encodes digest bytes as RFC 4648 base32, uppercase and unpadded, the
/// printable form of the `sha256new` format.
pub fn base32_encode(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes)
}
