pub fn slice_to_hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a hex string (with or without `:` / `-` separators) into bytes.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = input.chars().filter(|c| *c != ':' && *c != '-').collect();
    if cleaned.len() % 2 != 0 {
        return Err(format!("Odd-length hex string: {}", input));
    }
    let mut out = Vec::with_capacity(cleaned.len() / 2);
    let chars: Vec<char> = cleaned.chars().collect();
    for pair in chars.chunks(2) {
        let byte = u8::from_str_radix(&pair.iter().collect::<String>(), 16)
            .map_err(|_| format!("Invalid hex string: {}", input))?;
        out.push(byte);
    }
    Ok(out)
}

/// Parse a WEP key given either as hex or as a 5/13 character ASCII key.
pub fn parse_wep_key(input: &str) -> Result<Vec<u8>, String> {
    if let Ok(bytes) = parse_hex(input) {
        if bytes.len() == 5 || bytes.len() == 13 {
            return Ok(bytes);
        }
    }
    if input.len() == 5 || input.len() == 13 {
        return Ok(input.as_bytes().to_vec());
    }
    Err(format!(
        "WEP key must be 5 or 13 bytes (hex or ASCII): {}",
        input
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex("0a1b2c").unwrap(), vec![0x0a, 0x1b, 0x2c]);
        assert_eq!(parse_hex("0a:1b:2c").unwrap(), vec![0x0a, 0x1b, 0x2c]);
        assert!(parse_hex("0a1").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn wep_key_parsing() {
        assert_eq!(parse_wep_key("abcde").unwrap(), b"abcde".to_vec());
        assert_eq!(parse_wep_key("1122334455").unwrap().len(), 5);
        assert!(parse_wep_key("112233").is_err());
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(slice_to_hex_string(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
