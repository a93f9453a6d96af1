//! ImageBytes framing
//!
//! An `application/imagebytes` body is a fixed metadata header followed
//! directly by the element bytes. Every header field is a little-endian
//! 32-bit integer:
//!
//! | offset | field                    |
//! |--------|--------------------------|
//! | 0      | metadata version (1)     |
//! | 4      | error number             |
//! | 8      | client transaction id    |
//! | 12     | server transaction id    |
//! | 16     | image element type       |
//! | 20     | transmission element type|
//! | 24     | rank                     |
//! | 28     | dimension 1              |
//! | 32     | dimension 2              |
//! | 36     | dimension 3 (0 if rank 2)|
//!
//! When the error number is non-zero the bytes after the header carry the
//! UTF-8 error message instead of an array.

use crate::imagearray::{decode_binary, ImageArray, ImageElementType};
use crate::CodecError;

/// The only metadata version this client understands
pub const METADATA_VERSION: i32 = 1;

/// Size of the version 1 header
pub const HEADER_LEN: usize = 40;

/// Decoded version 1 metadata header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBytesMetadata {
    pub metadata_version: i32,
    pub error_number: i32,
    pub client_transaction_id: u32,
    pub server_transaction_id: u32,
    pub image_element_type: i32,
    pub transmission_element_type: i32,
    pub rank: i32,
    pub dimension1: i32,
    pub dimension2: i32,
    pub dimension3: i32,
}

impl ImageBytesMetadata {
    /// Header describing `array`, sent in its own element type
    pub fn for_array(array: &ImageArray, client_transaction_id: u32, server_transaction_id: u32) -> Self {
        let dims = array.dimensions();
        let dim = |i: usize| dims.get(i).map(|&d| d as i32).unwrap_or(0);
        Self {
            metadata_version: METADATA_VERSION,
            error_number: 0,
            client_transaction_id,
            server_transaction_id,
            image_element_type: array.element_type().code(),
            transmission_element_type: array.element_type().code(),
            rank: array.rank() as i32,
            dimension1: dim(0),
            dimension2: dim(1),
            dimension3: dim(2),
        }
    }

    fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::HeaderTooShort {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let field = |index: usize| {
            let at = index * 4;
            i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        let metadata_version = field(0);
        if metadata_version != METADATA_VERSION {
            return Err(CodecError::UnsupportedMetadataVersion(metadata_version));
        }

        Ok(Self {
            metadata_version,
            error_number: field(1),
            client_transaction_id: field(2) as u32,
            server_transaction_id: field(3) as u32,
            image_element_type: field(4),
            transmission_element_type: field(5),
            rank: field(6),
            dimension1: field(7),
            dimension2: field(8),
            dimension3: field(9),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        for value in [
            self.metadata_version,
            self.error_number,
            self.client_transaction_id as i32,
            self.server_transaction_id as i32,
            self.image_element_type,
            self.transmission_element_type,
            self.rank,
            self.dimension1,
            self.dimension2,
            self.dimension3,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Dimension lengths for the declared rank
    pub fn dimensions(&self) -> Result<Vec<usize>, CodecError> {
        let rank = match self.rank {
            2 => 2,
            3 => 3,
            other => return Err(CodecError::UnsupportedRank(other as i64)),
        };
        [self.dimension1, self.dimension2, self.dimension3][..rank]
            .iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| CodecError::InvalidField {
                    field: "Dimension",
                    detail: format!("negative length {}", d),
                })
            })
            .collect()
    }
}

/// A parsed ImageBytes body: header plus the bytes that follow it
#[derive(Debug, Clone, Copy)]
pub struct ImageBytesFrame<'a> {
    pub metadata: ImageBytesMetadata,
    pub payload: &'a [u8],
}

impl<'a> ImageBytesFrame<'a> {
    /// Split an ImageBytes body into header and payload
    pub fn parse(body: &'a [u8]) -> Result<Self, CodecError> {
        let metadata = ImageBytesMetadata::parse(body)?;
        Ok(Self {
            metadata,
            payload: &body[HEADER_LEN..],
        })
    }

    pub fn is_error(&self) -> bool {
        self.metadata.error_number != 0
    }

    /// Device error message carried after the header of an error frame
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(self.payload).trim_end_matches('\0').to_string()
    }

    /// Decode the payload into an array
    pub fn to_array(&self) -> Result<ImageArray, CodecError> {
        let image_type = ImageElementType::from_code(self.metadata.image_element_type)?;
        let transmission_type = ImageElementType::from_code(self.metadata.transmission_element_type)?;
        decode_binary(image_type, transmission_type, self.metadata.dimensions()?, self.payload)
    }
}

/// Encode an array as an ImageBytes body
pub fn encode(array: &ImageArray, client_transaction_id: u32, server_transaction_id: u32) -> Vec<u8> {
    let metadata = ImageBytesMetadata::for_array(array, client_transaction_id, server_transaction_id);
    let payload = array.to_le_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    metadata.write(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Encode a header with an explicit transmission type and payload bytes
pub fn encode_raw(metadata: &ImageBytesMetadata, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    metadata.write(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Encode an error frame
pub fn encode_error(
    error_number: i32,
    message: &str,
    client_transaction_id: u32,
    server_transaction_id: u32,
) -> Vec<u8> {
    let metadata = ImageBytesMetadata {
        metadata_version: METADATA_VERSION,
        error_number,
        client_transaction_id,
        server_transaction_id,
        image_element_type: 0,
        transmission_element_type: 0,
        rank: 0,
        dimension1: 0,
        dimension2: 0,
        dimension3: 0,
    };
    encode_raw(&metadata, message.as_bytes())
}
