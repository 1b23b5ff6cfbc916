//! Deflate helpers used by the envelope.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::ProtocolError;

/// Deflates `data`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder =
        DeflateEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::fast());
    encoder.write_all(data).map_err(ProtocolError::Compression)?;
    encoder.finish().map_err(ProtocolError::Compression)
}

/// Inflates `data`. Bytes that are not a deflate stream are an error.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(ProtocolError::Compression)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_shrinks_repetitive_data() {
        let data = vec![b'a'; 4096];
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_compress_empty_input() {
        let packed = compress(&[]).unwrap();
        assert!(decompress(&packed).unwrap().is_empty());
    }
}
