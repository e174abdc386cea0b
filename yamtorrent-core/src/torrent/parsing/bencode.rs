//! Bencode parsing logic and info hash calculation

use sha1::{Digest, Sha1};

use super::types::{TorrentFile, TorrentMetadata};
use crate::torrent::{InfoHash, PieceLayout, TorrentError};

// Type aliases for complex bencode types
pub(super) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(super) type ParseResult<T> = Result<T, TorrentError>;
pub(super) type BytesResult<'a> = Result<&'a [u8], TorrentError>;
pub(super) type FilesResult = ParseResult<(Vec<TorrentFile>, u64)>;

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse bencode data and extract torrent metadata
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or metadata extraction failed
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };

        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_metadata_from_dict(dict, torrent_bytes)
        } else {
            Err(invalid("Root element must be dictionary"))
        }
    }

    /// Extract torrent metadata from bencode dictionary
    fn extract_metadata_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentMetadata> {
        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing or invalid 'info' dictionary"));
        };

        let info_hash = Self::calculate_info_hash(original_data)?;

        let name = Self::extract_bytes_as_string(info, b"name")?;
        let piece_length = Self::extract_integer(info, b"piece length")?;
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| invalid(format!("Piece length {piece_length} out of range")))?;

        let pieces_bytes = Self::extract_bytes(info, b"pieces")?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(invalid(format!(
                "Pieces field length {} is not a multiple of 20",
                pieces_bytes.len()
            )));
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
            (Some(bencode_rs::Value::Integer(length)), _) => {
                let length = u64::try_from(*length)
                    .map_err(|_| invalid(format!("Negative file length {length}")))?;
                let files = vec![TorrentFile {
                    path: vec![name.clone()],
                    length,
                }];
                (files, length)
            }
            (None, Some(bencode_rs::Value::List(files_list))) => {
                Self::extract_files_info(files_list)?
            }
            _ => return Err(invalid("Missing 'files' or 'length' field")),
        };

        // Rejects piece tables that do not cover exactly total_length bytes
        PieceLayout::new(piece_length, total_length, piece_hashes.len() as u32)?;

        let announce_urls = Self::extract_announce_urls(dict)?;

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            announce_urls,
        })
    }

    /// SHA-1 over the exact encoded bytes of the root dictionary's `info` value.
    fn calculate_info_hash(original_data: &[u8]) -> Result<InfoHash, TorrentError> {
        let (start, end) = Self::find_info_span(original_data)?;

        let digest = Sha1::digest(&original_data[start..end]);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);

        Ok(InfoHash::new(hash))
    }

    /// Locates the byte range of the `info` value by walking the root dictionary.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the root is not a dictionary or has no `info` key
    pub fn find_info_span(data: &[u8]) -> Result<(usize, usize), TorrentError> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        while data.get(pos) != Some(&b'e') {
            let key_start = pos;
            pos = Self::find_value_end(data, pos)?;
            let key = Self::string_contents(&data[key_start..pos])?;

            let value_start = pos;
            pos = Self::find_value_end(data, pos)?;
            if key == b"info" {
                return Ok((value_start, pos));
            }
        }

        Err(invalid("Missing 'info' field"))
    }

    /// Returns the position just past the bencoded value starting at `pos`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is truncated or malformed
    pub fn find_value_end(data: &[u8], pos: usize) -> Result<usize, TorrentError> {
        match data.get(pos) {
            Some(b'i') => {
                let end = data[pos..]
                    .iter()
                    .position(|&byte| byte == b'e')
                    .ok_or_else(|| invalid("Unterminated integer"))?;
                Ok(pos + end + 1)
            }
            Some(b'l') | Some(b'd') => {
                let mut pos = pos + 1;
                while data.get(pos) != Some(&b'e') {
                    if pos >= data.len() {
                        return Err(invalid("Incomplete bencode container"));
                    }
                    pos = Self::find_value_end(data, pos)?;
                }
                Ok(pos + 1)
            }
            Some(b'0'..=b'9') => {
                let colon = data[pos..]
                    .iter()
                    .position(|&byte| byte == b':')
                    .ok_or_else(|| invalid("Invalid string format"))?;
                let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                    .ok()
                    .and_then(|digits| digits.parse().ok())
                    .ok_or_else(|| invalid("Invalid string length"))?;

                pos.checked_add(colon + 1)
                    .and_then(|start| start.checked_add(length))
                    .filter(|end| *end <= data.len())
                    .ok_or_else(|| invalid("String extends past end of data"))
            }
            Some(_) => Err(invalid("Invalid bencode character")),
            None => Err(invalid("Unexpected end of bencode data")),
        }
    }

    fn string_contents(encoded: &[u8]) -> BytesResult<'_> {
        let colon = encoded
            .iter()
            .position(|&byte| byte == b':')
            .ok_or_else(|| invalid("Dictionary key must be a string"))?;
        Ok(&encoded[colon + 1..])
    }

    /// Extract string from bencode dictionary
    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    /// Extract bytes from bencode dictionary
    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> BytesResult<'a> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Extract integer from bencode dictionary
    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Extract files information from multi-file torrent
    fn extract_files_info(files_list: &[bencode_rs::Value<'_>]) -> FilesResult {
        let mut files = Vec::new();
        let mut total_length = 0u64;

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(invalid("Invalid file entry type"));
            };

            let length = Self::extract_integer(file_dict, b"length")?;
            let length =
                u64::try_from(length).map_err(|_| invalid(format!("Negative file length {length}")))?;
            total_length += length;

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice()) else {
                return Err(invalid("Missing or invalid path in file"));
            };

            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let bencode_rs::Value::Bytes(component) = component else {
                    return Err(invalid("Invalid path component type"));
                };
                let component = String::from_utf8(component.to_vec())
                    .map_err(|_| invalid("Invalid UTF-8 in file path"))?;
                path.push(component);
            }

            files.push(TorrentFile { path, length });
        }

        Ok((files, total_length))
    }

    /// Extract announce URLs from torrent dictionary
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> ParseResult<Vec<String>> {
        let mut announce_urls = Vec::new();

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            announce_urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                if let bencode_rs::Value::List(tier_urls) = tier {
                    for url_value in tier_urls {
                        if let bencode_rs::Value::Bytes(url_bytes) = url_value
                            && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                            && !announce_urls.contains(&url)
                        {
                            announce_urls.push(url);
                        }
                    }
                }
            }
        }

        if announce_urls.is_empty() {
            return Err(invalid("No announce URLs found"));
        }

        Ok(announce_urls)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_find_value_end_nested() {
        let data = b"d3:keyd4:namei42eee";
        assert_eq!(BencodeParser::find_value_end(data, 0).unwrap(), data.len());

        let data = b"d4:listl4:testi42eee";
        assert_eq!(BencodeParser::find_value_end(data, 0).unwrap(), data.len());
    }

    #[test]
    fn test_find_value_end_rejects_truncation() {
        assert!(BencodeParser::find_value_end(b"d3:key", 0).is_err());
        assert!(BencodeParser::find_value_end(b"d3:key999:", 0).is_err());
        assert!(BencodeParser::find_value_end(b"i42", 0).is_err());
    }

    #[test]
    fn test_find_value_end_rejects_huge_string_length() {
        let data = format!("d3:key{}:xe", usize::MAX);
        assert!(matches!(
            BencodeParser::find_value_end(data.as_bytes(), 0),
            Err(TorrentError::InvalidTorrentFile { .. })
        ));
        assert!(BencodeParser::find_value_end(b"18446744073709551615:x", 0).is_err());
    }

    #[test]
    fn test_info_span_ignores_info_text_in_other_values() {
        // A string value containing "4:info" precedes the real info key
        let data = b"d7:comment6:4:info4:infod4:name1:xee";
        let (start, end) = BencodeParser::find_info_span(data).unwrap();
        assert_eq!(&data[start..end], b"d4:name1:xe");
    }

    #[test]
    fn test_info_span_requires_dictionary_root() {
        assert!(BencodeParser::find_info_span(b"l4:infoe").is_err());
        assert!(BencodeParser::find_info_span(b"d4:name1:xe").is_err());
    }

    #[test]
    fn test_extract_bytes() {
        let mut bencode_dict = HashMap::new();
        bencode_dict.insert(b"test".as_slice(), bencode_rs::Value::Bytes(b"value"));

        let result = BencodeParser::extract_bytes(&bencode_dict, b"test").unwrap();
        assert_eq!(result, b"value");
        assert!(BencodeParser::extract_bytes(&bencode_dict, b"missing").is_err());
    }

    #[test]
    fn test_extract_integer() {
        let mut bencode_dict = HashMap::new();
        bencode_dict.insert(b"n".as_slice(), bencode_rs::Value::Integer(42));
        bencode_dict.insert(b"s".as_slice(), bencode_rs::Value::Bytes(b"42"));

        assert_eq!(BencodeParser::extract_integer(&bencode_dict, b"n").unwrap(), 42);
        assert!(BencodeParser::extract_integer(&bencode_dict, b"s").is_err());
    }
}
