/// Lowercase hex encoding of an arbitrary byte slice, used for the WinGet
/// content-addressed hash prefix (`hash8`).
pub fn lowercase_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(&mut s, "{:02x}", b).unwrap();
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_prefix() {
        assert_eq!(lowercase_hex(&[0xAB, 0x01, 0xFF, 0x00]), "ab01ff00");
    }
}
