/* Intel HEX image parsing.
 *
 * Only what an EZ-USB anchor load needs: 16-bit data records and the EOF
 * record. Segment and linear address records would place code outside the
 * 8051's 64 KiB space and are refused. */

use std::path::{Path, PathBuf};

use thiserror::Error;

/* Largest payload of a single anchor-load control transfer. */
pub const MAX_RECORD_DATA: usize = 16;

const TYPE_DATA: u8 = 0x00;
const TYPE_EOF: u8 = 0x01;

#[derive(Debug, Error)]
pub enum HexError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: missing ':' start code")]
    MissingStartCode { line: usize },

    #[error("line {line}: malformed hex digits")]
    BadDigits { line: usize },

    #[error("line {line}: record length {declared} does not match {actual} data bytes")]
    LengthMismatch {
        line: usize,
        declared: usize,
        actual: usize,
    },

    #[error("line {line}: checksum 0x{found:02x}, expected 0x{expected:02x}")]
    Checksum { line: usize, found: u8, expected: u8 },

    #[error("line {line}: unsupported record type 0x{kind:02x}")]
    UnsupportedRecord { line: usize, kind: u8 },

    #[error("line {line}: record crosses the 64 KiB address space")]
    AddressOverflow { line: usize },

    #[error("no end-of-file record")]
    MissingEof,
}

/* One data record as handed to the device. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    pub records: Vec<HexRecord>,
}

impl HexImage {
    pub fn from_file(path: &Path) -> Result<Self, HexError> {
        let text = std::fs::read_to_string(path).map_err(|source| HexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /* Parse HEX text. Scanning stops at the EOF record; data records longer
     * than `MAX_RECORD_DATA` are split. */
    pub fn parse(text: &str) -> Result<Self, HexError> {
        let mut records = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let body = raw
                .strip_prefix(':')
                .ok_or(HexError::MissingStartCode { line })?;
            let bytes = decode_hex(body).ok_or(HexError::BadDigits { line })?;
            if bytes.len() < 5 {
                return Err(HexError::LengthMismatch {
                    line,
                    declared: bytes.first().copied().unwrap_or(0) as usize,
                    actual: bytes.len().saturating_sub(5),
                });
            }

            let (payload, checksum) = bytes.split_at(bytes.len() - 1);
            let expected = payload
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b))
                .wrapping_neg();
            if checksum[0] != expected {
                return Err(HexError::Checksum {
                    line,
                    found: checksum[0],
                    expected,
                });
            }

            let declared = payload[0] as usize;
            let address = u16::from_be_bytes([payload[1], payload[2]]);
            let kind = payload[3];
            let data = &payload[4..];
            if data.len() != declared {
                return Err(HexError::LengthMismatch {
                    line,
                    declared,
                    actual: data.len(),
                });
            }

            match kind {
                TYPE_DATA => {
                    if usize::from(address) + data.len() > 0x1_0000 {
                        return Err(HexError::AddressOverflow { line });
                    }
                    for (n, chunk) in data.chunks(MAX_RECORD_DATA).enumerate() {
                        records.push(HexRecord {
                            address: address + (n * MAX_RECORD_DATA) as u16,
                            data: chunk.to_vec(),
                        });
                    }
                }
                TYPE_EOF => return Ok(Self { records }),
                other => return Err(HexError::UnsupportedRecord { line, kind: other }),
            }
        }

        Err(HexError::MissingEof)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /* Total payload size in bytes. */
    pub fn size(&self) -> usize {
        self.records.iter().map(|r| r.data.len()).sum()
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_stops_at_eof() {
        let text = "\
:0300300002337A1E
:03010000AABBCCCB
:00000001FF
:0300400002337A0E
";
        let image = HexImage::parse(text).unwrap();
        assert_eq!(
            image.records,
            vec![
                HexRecord {
                    address: 0x0030,
                    data: vec![0x02, 0x33, 0x7a],
                },
                HexRecord {
                    address: 0x0100,
                    data: vec![0xaa, 0xbb, 0xcc],
                },
            ]
        );
        assert_eq!(image.size(), 6);
    }

    #[test]
    fn long_records_are_split() {
        /* 20 bytes of 0x11 at 0x2000 */
        let mut line = String::from(":14200000");
        let mut sum: u8 = 0x14u8.wrapping_add(0x20);
        for _ in 0..20 {
            line.push_str("11");
            sum = sum.wrapping_add(0x11);
        }
        line.push_str(&format!("{:02X}\n:00000001FF\n", sum.wrapping_neg()));

        let image = HexImage::parse(&line).unwrap();
        assert_eq!(image.len(), 2);
        assert_eq!(image.records[0].address, 0x2000);
        assert_eq!(image.records[0].data.len(), 16);
        assert_eq!(image.records[1].address, 0x2010);
        assert_eq!(image.records[1].data.len(), 4);
    }

    #[test]
    fn bad_checksum() {
        let err = HexImage::parse(":03003000023379FF\n").unwrap_err();
        assert!(matches!(err, HexError::Checksum { line: 1, .. }));
    }

    #[test]
    fn rejects_extended_address() {
        let err = HexImage::parse(":020000040001F9\n:00000001FF\n").unwrap_err();
        assert!(matches!(
            err,
            HexError::UnsupportedRecord { line: 1, kind: 0x04 }
        ));
    }

    #[test]
    fn missing_eof_and_start_code() {
        assert!(matches!(
            HexImage::parse(":0300300002337A1E\n").unwrap_err(),
            HexError::MissingEof
        ));
        assert!(matches!(
            HexImage::parse("0300300002337A1E\n").unwrap_err(),
            HexError::MissingStartCode { line: 1 }
        ));
    }
}
