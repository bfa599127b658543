use portico_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Character set used by line codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charset {
    /// UTF-8
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    /// US-ASCII, 7 bit
    #[serde(alias = "us-ascii")]
    Ascii,
    /// ISO-8859-1
    #[serde(alias = "iso-8859-1")]
    Latin1,
}

/// What to do with bytes or characters the charset cannot represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Substitute U+FFFD when decoding and `?` when encoding
    #[default]
    Replace,
    /// Skip the offending input
    Ignore,
    /// Fail the whole record
    Strict,
}

impl Charset {
    /// Decodes `bytes` to text.
    pub fn decode(&self, bytes: &[u8], policy: ErrorPolicy) -> Result<String> {
        match self {
            Charset::Utf8 => decode_utf8(bytes, policy),
            Charset::Ascii => {
                let mut text = String::with_capacity(bytes.len());
                for &b in bytes {
                    if b.is_ascii() {
                        text.push(b as char);
                    } else {
                        match policy {
                            ErrorPolicy::Replace => text.push(char::REPLACEMENT_CHARACTER),
                            ErrorPolicy::Ignore => {}
                            ErrorPolicy::Strict => {
                                return Err(Error::Decode(format!("non-ascii byte 0x{:02x}", b)))
                            }
                        }
                    }
                }
                Ok(text)
            }
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Encodes `text` to bytes.
    pub fn encode(&self, text: &str, policy: ErrorPolicy) -> Result<Vec<u8>> {
        let limit = match self {
            Charset::Utf8 => return Ok(text.as_bytes().to_vec()),
            Charset::Ascii => 0x7f,
            Charset::Latin1 => 0xff,
        };
        let mut bytes = Vec::with_capacity(text.len());
        for c in text.chars() {
            let code = c as u32;
            if code <= limit {
                bytes.push(code as u8);
                continue;
            }
            match policy {
                ErrorPolicy::Replace => bytes.push(b'?'),
                ErrorPolicy::Ignore => {}
                ErrorPolicy::Strict => {
                    return Err(Error::Encode(format!(
                        "{:?} cannot be encoded as {:?}",
                        c, self
                    )))
                }
            }
        }
        Ok(bytes)
    }
}

fn decode_utf8(mut bytes: &[u8], policy: ErrorPolicy) -> Result<String> {
    match policy {
        ErrorPolicy::Replace => Ok(String::from_utf8_lossy(bytes).into_owned()),
        ErrorPolicy::Strict => std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|err| Error::Decode(err.to_string())),
        ErrorPolicy::Ignore => {
            let mut text = String::with_capacity(bytes.len());
            loop {
                match std::str::from_utf8(bytes) {
                    Ok(valid) => {
                        text.push_str(valid);
                        return Ok(text);
                    }
                    Err(err) => {
                        let (valid, rest) = bytes.split_at(err.valid_up_to());
                        text.push_str(&String::from_utf8_lossy(valid));
                        let skip = err.error_len().unwrap_or(rest.len());
                        bytes = &rest[skip..];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Charset::Utf8, ErrorPolicy::Replace, b"a\xffb", "a\u{fffd}b")]
    #[case(Charset::Utf8, ErrorPolicy::Ignore, b"a\xffb\xe2\x82", "ab")]
    #[case(Charset::Ascii, ErrorPolicy::Replace, b"a\xe9", "a\u{fffd}")]
    #[case(Charset::Ascii, ErrorPolicy::Ignore, b"a\xe9b", "ab")]
    #[case(Charset::Latin1, ErrorPolicy::Strict, b"caf\xe9", "caf\u{e9}")]
    fn decodes(
        #[case] charset: Charset,
        #[case] policy: ErrorPolicy,
        #[case] bytes: &[u8],
        #[case] expected: &str,
    ) {
        assert_eq!(charset.decode(bytes, policy).unwrap(), expected);
    }

    #[rstest]
    #[case(Charset::Utf8)]
    #[case(Charset::Ascii)]
    fn strict_rejects_invalid_input(#[case] charset: Charset) {
        assert!(matches!(
            charset.decode(b"\xff", ErrorPolicy::Strict),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn encodes_with_policy() {
        assert_eq!(Charset::Ascii.encode("né", ErrorPolicy::Replace).unwrap(), b"n?");
        assert_eq!(Charset::Ascii.encode("né", ErrorPolicy::Ignore).unwrap(), b"n");
        assert_eq!(Charset::Latin1.encode("né", ErrorPolicy::Strict).unwrap(), b"n\xe9");
        assert!(Charset::Latin1.encode("€", ErrorPolicy::Strict).is_err());
        assert_eq!(Charset::Utf8.encode("€", ErrorPolicy::Strict).unwrap(), "€".as_bytes());
    }

    #[test]
    fn parses_common_names() {
        let charset: Charset = serde_json::from_str(r#""iso-8859-1""#).unwrap();
        assert_eq!(charset, Charset::Latin1);
        let charset: Charset = serde_json::from_str(r#""ascii""#).unwrap();
        assert_eq!(charset, Charset::Ascii);
    }
}
