//! Camera image array codec
//!
//! An Alpaca camera returns its pixels as a rank 2 (`[x][y]`) or rank 3
//! (`[x][y][plane]`) array of Int16, Int32 or Double. The server may send it
//! in one of three ways:
//!
//! - JSON: nested arrays in the `Value` field of the normal envelope
//! - base64 hand-off: a small JSON descriptor, then a second GET to
//!   `{uri}/base64` returning the raw element bytes as base64 text
//! - ImageBytes: a single `application/imagebytes` body holding a metadata
//!   header followed by the raw element bytes (see [`crate::imagebytes`])
//!
//! Whatever the transfer mode, the decoded result is an [`ImageArray`]: the
//! dimensions plus a flat row-major buffer in the same order as the nested
//! JSON (`index = (i * d2 + j) * d3 + k`).

use crate::{CodecError, Envelope};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media type of the normal JSON envelope
pub const JSON_MIME_TYPE: &str = "application/json";

/// Media type of an ImageBytes response
pub const IMAGE_BYTES_MIME_TYPE: &str = "application/imagebytes";

/// Request/response header signalling base64 hand-off support
pub const BASE64_HANDOFF_HEADER: &str = "base64handoff";

/// Value sent with [`BASE64_HANDOFF_HEADER`] on requests
pub const BASE64_HANDOFF_SUPPORTED: &str = "true";

/// Path segment appended to the image array URI for the hand-off download
pub const BASE64_HANDOFF_SUFFIX: &str = "base64";

/// ASCOM `ImageArrayElementTypes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageElementType {
    Unknown = 0,
    Int16 = 1,
    Int32 = 2,
    Double = 3,
    Single = 4,
    UInt64 = 5,
    Byte = 6,
    Int64 = 7,
    UInt16 = 8,
    UInt32 = 9,
}

impl ImageElementType {
    pub fn from_code(code: i32) -> Result<Self, CodecError> {
        match code {
            0 => Ok(ImageElementType::Unknown),
            1 => Ok(ImageElementType::Int16),
            2 => Ok(ImageElementType::Int32),
            3 => Ok(ImageElementType::Double),
            4 => Ok(ImageElementType::Single),
            5 => Ok(ImageElementType::UInt64),
            6 => Ok(ImageElementType::Byte),
            7 => Ok(ImageElementType::Int64),
            8 => Ok(ImageElementType::UInt16),
            9 => Ok(ImageElementType::UInt32),
            other => Err(CodecError::UnsupportedElementType(other)),
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Size of one element on the wire
    pub fn size(&self) -> Option<usize> {
        match self {
            ImageElementType::Unknown => None,
            ImageElementType::Byte => Some(1),
            ImageElementType::Int16 | ImageElementType::UInt16 => Some(2),
            ImageElementType::Int32 | ImageElementType::UInt32 | ImageElementType::Single => Some(4),
            ImageElementType::Double | ImageElementType::Int64 | ImageElementType::UInt64 => Some(8),
        }
    }

    /// Whether every value of `transmission` is exactly representable as `self`
    pub fn can_widen_from(&self, transmission: ImageElementType) -> bool {
        use ImageElementType::*;
        matches!(
            (*self, transmission),
            (Int16, Byte | Int16)
                | (Int32, Byte | Int16 | UInt16 | Int32)
                | (Double, Byte | Int16 | UInt16 | Int32 | UInt32 | Single | Double)
        )
    }
}

/// A fixed-size little-endian value that can appear in a binary payload
pub trait WireElement: Copy + Send + Sync + 'static {
    const SIZE: usize;
    const ELEMENT_TYPE: ImageElementType;

    /// Read one element from exactly `SIZE` bytes
    fn read_le(chunk: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
    fn to_f64(self) -> f64;
}

macro_rules! wire_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {$(
        impl WireElement for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            const ELEMENT_TYPE: ImageElementType = ImageElementType::$tag;

            fn read_le(chunk: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(chunk);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

wire_element!(
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    f32 => Single,
    f64 => Double,
);

/// An element type an [`ImageArray`] can hold
pub trait ImageElement: WireElement {
    fn from_json(value: &Value) -> Option<Self>;
    fn to_json(self) -> Value;
    /// Convert a value already known to be representable
    fn from_f64(value: f64) -> Self;
    fn into_data(values: Vec<Self>) -> ImageData;
    fn to_variant(self) -> Variant;
}

impl ImageElement for i16 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|v| i16::try_from(v).ok())
    }

    fn to_json(self) -> Value {
        Value::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as i16
    }

    fn into_data(values: Vec<Self>) -> ImageData {
        ImageData::Int16(values)
    }

    fn to_variant(self) -> Variant {
        Variant::Int16(self)
    }
}

impl ImageElement for i32 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    fn to_json(self) -> Value {
        Value::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }

    fn into_data(values: Vec<Self>) -> ImageData {
        ImageData::Int32(values)
    }

    fn to_variant(self) -> Variant {
        Variant::Int32(self)
    }
}

impl ImageElement for f64 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64()
    }

    fn to_json(self) -> Value {
        Value::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn into_data(values: Vec<Self>) -> ImageData {
        ImageData::Double(values)
    }

    fn to_variant(self) -> Variant {
        Variant::Double(self)
    }
}

/// Flat element storage of an [`ImageArray`]
#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Double(Vec<f64>),
}

impl ImageData {
    pub fn element_type(&self) -> ImageElementType {
        match self {
            ImageData::Int16(_) => ImageElementType::Int16,
            ImageData::Int32(_) => ImageElementType::Int32,
            ImageData::Double(_) => ImageElementType::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ImageData::Int16(v) => v.len(),
            ImageData::Int32(v) => v.len(),
            ImageData::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded rank 2 or rank 3 image array
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    dimensions: Vec<usize>,
    data: ImageData,
}

impl ImageArray {
    /// Build an array, checking the rank and that the buffer fills the dimensions exactly
    pub fn new(dimensions: Vec<usize>, data: ImageData) -> Result<Self, CodecError> {
        check_rank(dimensions.len() as i64)?;
        let expected = element_count(&dimensions)?;
        if data.len() != expected {
            return Err(CodecError::NotRectangular(format!(
                "{} elements for dimensions {:?}",
                data.len(),
                dimensions
            )));
        }
        Ok(Self { dimensions, data })
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn element_type(&self) -> ImageElementType {
        self.data.element_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ImageData {
        &self.data
    }

    pub fn into_data(self) -> ImageData {
        self.data
    }

    pub fn as_i16(&self) -> Option<&[i16]> {
        match &self.data {
            ImageData::Int16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            ImageData::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ImageData::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Element at `[i, j]` or `[i, j, k]`
    pub fn get(&self, index: &[usize]) -> Option<Variant> {
        if index.len() != self.dimensions.len() {
            return None;
        }
        let mut flat = 0usize;
        for (&i, &d) in index.iter().zip(&self.dimensions) {
            if i >= d {
                return None;
            }
            flat = flat * d + i;
        }
        Some(match &self.data {
            ImageData::Int16(v) => Variant::Int16(v[flat]),
            ImageData::Int32(v) => Variant::Int32(v[flat]),
            ImageData::Double(v) => Variant::Double(v[flat]),
        })
    }

    /// Box every element into a [`Variant`]
    pub fn to_variant_array(&self) -> VariantArray {
        let values = match &self.data {
            ImageData::Int16(v) => box_elements(v),
            ImageData::Int32(v) => box_elements(v),
            ImageData::Double(v) => box_elements(v),
        };
        VariantArray {
            dimensions: self.dimensions.clone(),
            values,
        }
    }

    /// Nested JSON array in the `Value` layout
    pub fn to_json_value(&self) -> Value {
        match &self.data {
            ImageData::Int16(v) => nest(v, &self.dimensions),
            ImageData::Int32(v) => nest(v, &self.dimensions),
            ImageData::Double(v) => nest(v, &self.dimensions),
        }
    }

    /// Raw little-endian element bytes, as sent by the binary transfer modes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            ImageData::Int16(v) => write_elements(v),
            ImageData::Int32(v) => write_elements(v),
            ImageData::Double(v) => write_elements(v),
        }
    }
}

/// A type-erased array element
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variant {
    Int16(i16),
    Int32(i32),
    Double(f64),
}

impl Variant {
    pub fn as_f64(&self) -> f64 {
        match self {
            Variant::Int16(v) => *v as f64,
            Variant::Int32(v) => *v as f64,
            Variant::Double(v) => *v,
        }
    }
}

/// An image array with one boxed value per element
#[derive(Debug, Clone, PartialEq)]
pub struct VariantArray {
    pub dimensions: Vec<usize>,
    pub values: Vec<Variant>,
}

fn box_elements<T: ImageElement>(values: &[T]) -> Vec<Variant> {
    values.par_iter().map(|v| v.to_variant()).collect()
}

fn nest<T: ImageElement>(values: &[T], dimensions: &[usize]) -> Value {
    match dimensions {
        [] => Value::Array(Vec::new()),
        [_] => Value::Array(values.iter().map(|v| v.to_json()).collect()),
        [outer, inner @ ..] => {
            let block: usize = inner.iter().product();
            if block == 0 {
                Value::Array((0..*outer).map(|_| nest::<T>(&[], inner)).collect())
            } else {
                Value::Array(values.chunks(block).map(|chunk| nest(chunk, inner)).collect())
            }
        }
    }
}

fn write_elements<T: WireElement>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for v in values {
        v.write_le(&mut out);
    }
    out
}

fn check_rank(rank: i64) -> Result<usize, CodecError> {
    match rank {
        2 | 3 => Ok(rank as usize),
        other => Err(CodecError::UnsupportedRank(other)),
    }
}

/// Number of elements the dimensions describe
pub fn element_count(dimensions: &[usize]) -> Result<usize, CodecError> {
    dimensions
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| CodecError::DimensionOverflow(dimensions.to_vec()))
}

/// Reinterpret a little-endian byte buffer as `count` elements.
///
/// The buffer must hold exactly `count * W::SIZE` bytes; anything else is
/// rejected before a single element is produced.
pub fn reinterpret<W: WireElement>(bytes: &[u8], count: usize) -> Result<Vec<W>, CodecError> {
    let expected = count
        .checked_mul(W::SIZE)
        .ok_or(CodecError::LengthMismatch {
            expected: usize::MAX,
            actual: bytes.len(),
        })?;
    if bytes.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes.chunks_exact(W::SIZE).map(W::read_le).collect())
}

fn widen<W: WireElement, T: ImageElement>(bytes: &[u8], count: usize) -> Result<Vec<T>, CodecError> {
    Ok(reinterpret::<W>(bytes, count)?
        .into_iter()
        .map(|w| T::from_f64(w.to_f64()))
        .collect())
}

fn read_elements<T: ImageElement>(
    transmission: ImageElementType,
    bytes: &[u8],
    count: usize,
) -> Result<Vec<T>, CodecError> {
    if transmission == T::ELEMENT_TYPE {
        return reinterpret::<T>(bytes, count);
    }
    if !T::ELEMENT_TYPE.can_widen_from(transmission) {
        return Err(CodecError::UnsupportedTransmission {
            image: T::ELEMENT_TYPE,
            transmission,
        });
    }
    match transmission {
        ImageElementType::Byte => widen::<u8, T>(bytes, count),
        ImageElementType::Int16 => widen::<i16, T>(bytes, count),
        ImageElementType::UInt16 => widen::<u16, T>(bytes, count),
        ImageElementType::Int32 => widen::<i32, T>(bytes, count),
        ImageElementType::UInt32 => widen::<u32, T>(bytes, count),
        ImageElementType::Single => widen::<f32, T>(bytes, count),
        ImageElementType::Double => widen::<f64, T>(bytes, count),
        _ => Err(CodecError::UnsupportedTransmission {
            image: T::ELEMENT_TYPE,
            transmission,
        }),
    }
}

/// Decode a binary payload (hand-off or ImageBytes) into an [`ImageArray`]
pub fn decode_binary(
    image_type: ImageElementType,
    transmission_type: ImageElementType,
    dimensions: Vec<usize>,
    bytes: &[u8],
) -> Result<ImageArray, CodecError> {
    check_rank(dimensions.len() as i64)?;
    let count = element_count(&dimensions)?;
    let data = match image_type {
        ImageElementType::Int16 => ImageData::Int16(read_elements(transmission_type, bytes, count)?),
        ImageElementType::Int32 => ImageData::Int32(read_elements(transmission_type, bytes, count)?),
        ImageElementType::Double => ImageData::Double(read_elements(transmission_type, bytes, count)?),
        other => return Err(CodecError::UnsupportedElementType(other.code())),
    };
    ImageArray::new(dimensions, data)
}

/// Decode the nested `Value` of a JSON image array response
pub fn decode_json(element_type: ImageElementType, rank: i64, value: &Value) -> Result<ImageArray, CodecError> {
    let rank = check_rank(rank)?;
    match element_type {
        ImageElementType::Int16 => decode_json_typed::<i16>(rank, value),
        ImageElementType::Int32 => decode_json_typed::<i32>(rank, value),
        ImageElementType::Double => decode_json_typed::<f64>(rank, value),
        other => Err(CodecError::UnsupportedElementType(other.code())),
    }
}

/// Decode a JSON mode image array from its envelope (`Type`, `Rank`, `Value`)
pub fn decode_json_envelope(envelope: &Envelope) -> Result<ImageArray, CodecError> {
    let type_code = required_i64(envelope, "Type")?;
    let element_type = ImageElementType::from_code(code_to_i32(type_code)?)?;
    let rank = required_i64(envelope, "Rank")?;
    let value = envelope.field("Value").ok_or(CodecError::MissingField("Value"))?;
    decode_json(element_type, rank, value)
}

fn decode_json_typed<T: ImageElement>(rank: usize, value: &Value) -> Result<ImageArray, CodecError> {
    let outer = value.as_array().ok_or_else(|| CodecError::InvalidField {
        field: "Value",
        detail: "expected a nested array".to_string(),
    })?;

    // Each row of the outermost dimension decodes independently
    let rows: Vec<(Vec<usize>, Vec<T>)> = outer
        .par_iter()
        .enumerate()
        .map(|(row, item)| -> Result<(Vec<usize>, Vec<T>), CodecError> {
            let mut out = Vec::new();
            let shape = decode_nested::<T>(rank - 1, item, row, &mut out)?;
            Ok((shape, out))
        })
        .collect::<Result<_, CodecError>>()?;

    let inner_shape = match rows.first() {
        Some((shape, _)) => shape.clone(),
        None => vec![0; rank - 1],
    };
    if let Some((row, (shape, _))) = rows.iter().enumerate().find(|(_, (s, _))| *s != inner_shape) {
        return Err(CodecError::NotRectangular(format!(
            "row {} has shape {:?}, row 0 has {:?}",
            row, shape, inner_shape
        )));
    }

    let mut dimensions = Vec::with_capacity(rank);
    dimensions.push(outer.len());
    dimensions.extend(inner_shape);

    let mut data = Vec::with_capacity(element_count(&dimensions)?);
    for (_, block) in rows {
        data.extend(block);
    }
    ImageArray::new(dimensions, T::into_data(data))
}

fn decode_nested<T: ImageElement>(
    depth: usize,
    value: &Value,
    row: usize,
    out: &mut Vec<T>,
) -> Result<Vec<usize>, CodecError> {
    let items = value
        .as_array()
        .ok_or_else(|| CodecError::NotRectangular(format!("row {} is not nested {} deep", row, depth)))?;

    if depth == 1 {
        for item in items {
            let element = T::from_json(item).ok_or(CodecError::InvalidElement {
                row,
                element_type: T::ELEMENT_TYPE,
            })?;
            out.push(element);
        }
        return Ok(vec![items.len()]);
    }

    let mut inner_shape: Option<Vec<usize>> = None;
    for item in items {
        let shape = decode_nested(depth - 1, item, row, out)?;
        match &inner_shape {
            Some(expected) if *expected != shape => {
                return Err(CodecError::NotRectangular(format!(
                    "row {} mixes shapes {:?} and {:?}",
                    row, expected, shape
                )));
            }
            Some(_) => {}
            None => inner_shape = Some(shape),
        }
    }

    let mut shape = vec![items.len()];
    shape.extend(inner_shape.unwrap_or_else(|| vec![0; depth - 1]));
    Ok(shape)
}

fn required_i64(envelope: &Envelope, field: &'static str) -> Result<i64, CodecError> {
    envelope
        .field(field)
        .ok_or(CodecError::MissingField(field))?
        .as_i64()
        .ok_or_else(|| CodecError::InvalidField {
            field,
            detail: "expected an integer".to_string(),
        })
}

fn code_to_i32(code: i64) -> Result<i32, CodecError> {
    i32::try_from(code).map_err(|_| CodecError::UnsupportedElementType(-1))
}

/// Descriptor returned by the first request of a base64 hand-off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOffDescriptor {
    pub element_type: ImageElementType,
    pub dimensions: Vec<usize>,
}

impl HandOffDescriptor {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CodecError> {
        let element_type = ImageElementType::from_code(code_to_i32(required_i64(envelope, "Type")?)?)?;
        let rank = check_rank(required_i64(envelope, "Rank")?)?;

        let names = ["Dimension0Length", "Dimension1Length", "Dimension2Length"];
        let mut dimensions = Vec::with_capacity(rank);
        for &name in &names[..rank] {
            let length = required_i64(envelope, name)?;
            let length = usize::try_from(length).map_err(|_| CodecError::InvalidField {
                field: name,
                detail: format!("negative length {}", length),
            })?;
            dimensions.push(length);
        }

        Ok(Self {
            element_type,
            dimensions,
        })
    }

    /// Decode the downloaded base64 text into the described array
    pub fn decode_payload(&self, body: &[u8]) -> Result<ImageArray, CodecError> {
        let bytes = decode_base64(body)?;
        decode_binary(self.element_type, self.element_type, self.dimensions.clone(), &bytes)
    }
}

/// Decode base64 text, ignoring surrounding whitespace and JSON string quotes
pub fn decode_base64(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let text = std::str::from_utf8(body).map_err(|e| CodecError::Base64(e.to_string()))?;
    let text = text.trim().trim_matches('"');
    BASE64.decode(text).map_err(|e| CodecError::Base64(e.to_string()))
}

/// Transfer mode the server actually used for an image array response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Json,
    Base64HandOff,
    ImageBytes,
}

impl TransferMode {
    /// Pick the mode from the response content type and hand-off header.
    ///
    /// ImageBytes wins over hand-off, which wins over plain JSON.
    pub fn select(content_type: Option<&str>, handoff_header: bool) -> Result<Self, CodecError> {
        let content_type = content_type.ok_or(CodecError::MissingContentType)?;
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match media_type.as_str() {
            IMAGE_BYTES_MIME_TYPE => Ok(TransferMode::ImageBytes),
            JSON_MIME_TYPE if handoff_header => Ok(TransferMode::Base64HandOff),
            JSON_MIME_TYPE => Ok(TransferMode::Json),
            _ => Err(CodecError::UnsupportedContentType(content_type.to_string())),
        }
    }
}

/// Which image array transfer modes the client advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageArrayTransferType {
    Json,
    Base64HandOff,
    ImageBytes,
    #[default]
    BestAvailable,
}

impl ImageArrayTransferType {
    /// Headers added to an image array request
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let accept = |value: &str| ("Accept".to_string(), value.to_string());
        let handoff = || (BASE64_HANDOFF_HEADER.to_string(), BASE64_HANDOFF_SUPPORTED.to_string());
        let both = format!("{}, {}", IMAGE_BYTES_MIME_TYPE, JSON_MIME_TYPE);

        match self {
            ImageArrayTransferType::Json => vec![accept(JSON_MIME_TYPE)],
            ImageArrayTransferType::Base64HandOff => vec![accept(JSON_MIME_TYPE), handoff()],
            ImageArrayTransferType::ImageBytes => vec![accept(&both)],
            ImageArrayTransferType::BestAvailable => vec![accept(&both), handoff()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonCasing;
    use serde_json::json;

    pub(crate) fn sample_arrays() -> Vec<ImageArray> {
        let mut arrays = Vec::new();
        for dims in [vec![3usize, 2], vec![2usize, 3, 3]] {
            let n: usize = dims.iter().product();
            arrays.push(ImageArray::new(dims.clone(), ImageData::Int16((0..n).map(|i| i as i16 * 37 - 300).collect())).unwrap());
            arrays.push(ImageArray::new(dims.clone(), ImageData::Int32((0..n).map(|i| i as i32 * 70_001 - 65_536).collect())).unwrap());
            arrays.push(ImageArray::new(dims.clone(), ImageData::Double((0..n).map(|i| i as f64 * 0.25 - 1.5).collect())).unwrap());
        }
        arrays
    }

    #[test]
    fn test_json_round_trip() {
        for array in sample_arrays() {
            let value = array.to_json_value();
            let decoded = decode_json(array.element_type(), array.rank() as i64, &value).unwrap();
            assert_eq!(decoded, array);
        }
    }

    #[test]
    fn test_binary_round_trip() {
        for array in sample_arrays() {
            let bytes = array.to_le_bytes();
            let decoded = decode_binary(array.element_type(), array.element_type(), array.dimensions().to_vec(), &bytes).unwrap();
            assert_eq!(decoded, array);
        }
    }

    #[test]
    fn test_json_layout_matches_index() {
        let value = json!([[1, 2, 3], [4, 5, 6]]);
        let array = decode_json(ImageElementType::Int32, 2, &value).unwrap();
        assert_eq!(array.dimensions(), &[2, 3]);
        assert_eq!(array.as_i32().unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(array.get(&[1, 0]), Some(Variant::Int32(4)));
        assert_eq!(array.get(&[0, 2]), Some(Variant::Int32(3)));
        assert_eq!(array.get(&[2, 0]), None);
        assert_eq!(array.get(&[0]), None);
    }

    #[test]
    fn test_json_rank3_layout() {
        let value = json!([[[1, 2], [3, 4]], [[5, 6], [7, 8]]]);
        let array = decode_json(ImageElementType::Int16, 3, &value).unwrap();
        assert_eq!(array.dimensions(), &[2, 2, 2]);
        assert_eq!(array.get(&[1, 0, 1]), Some(Variant::Int16(6)));
    }

    #[test]
    fn test_json_ragged_is_rejected() {
        let value = json!([[1, 2, 3], [4, 5]]);
        assert!(matches!(
            decode_json(ImageElementType::Int32, 2, &value),
            Err(CodecError::NotRectangular(_))
        ));

        let value = json!([[[1, 2], [3]], [[5, 6], [7, 8]]]);
        assert!(matches!(
            decode_json(ImageElementType::Int32, 3, &value),
            Err(CodecError::NotRectangular(_))
        ));
    }

    #[test]
    fn test_json_wrong_nesting_is_rejected() {
        // Rank 3 declared, rank 2 sent
        let value = json!([[1, 2], [3, 4]]);
        assert!(decode_json(ImageElementType::Int32, 3, &value).is_err());
    }

    #[test]
    fn test_json_out_of_range_element() {
        let value = json!([[1, 40000]]);
        assert_eq!(
            decode_json(ImageElementType::Int16, 2, &value),
            Err(CodecError::InvalidElement {
                row: 0,
                element_type: ImageElementType::Int16
            })
        );
    }

    #[test]
    fn test_json_unsupported_rank_and_type() {
        let value = json!([1, 2, 3]);
        assert_eq!(decode_json(ImageElementType::Int32, 1, &value), Err(CodecError::UnsupportedRank(1)));
        assert_eq!(
            decode_json(ImageElementType::Byte, 2, &json!([[1]])),
            Err(CodecError::UnsupportedElementType(6))
        );
    }

    #[test]
    fn test_json_empty_array() {
        let array = decode_json(ImageElementType::Int32, 2, &json!([])).unwrap();
        assert_eq!(array.dimensions(), &[0, 0]);
        assert!(array.is_empty());
    }

    #[test]
    fn test_json_envelope() {
        let body = json!({
            "Type": 2,
            "Rank": 2,
            "Value": [[10, 20], [30, 40]],
            "ErrorNumber": 0,
            "ErrorMessage": "",
        });
        let envelope = Envelope::parse(body.to_string().as_bytes(), JsonCasing::Strict).unwrap();
        let array = decode_json_envelope(&envelope).unwrap();
        assert_eq!(array.as_i32().unwrap(), &[10, 20, 30, 40]);

        let missing = Envelope::parse(br#"{"Rank":2,"Value":[]}"#, JsonCasing::Strict).unwrap();
        assert_eq!(decode_json_envelope(&missing), Err(CodecError::MissingField("Type")));
    }

    #[test]
    fn test_reinterpret_length_mismatch() {
        assert_eq!(
            reinterpret::<i32>(&[0u8; 7], 2),
            Err(CodecError::LengthMismatch { expected: 8, actual: 7 })
        );
        assert_eq!(
            reinterpret::<i32>(&[0u8; 9], 2),
            Err(CodecError::LengthMismatch { expected: 8, actual: 9 })
        );
        assert_eq!(reinterpret::<i16>(&[1, 0, 2, 0], 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_widening_transmission() {
        let bytes: Vec<u8> = [1000u16, 65535, 0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let array = decode_binary(ImageElementType::Int32, ImageElementType::UInt16, vec![3, 1], &bytes).unwrap();
        assert_eq!(array.as_i32().unwrap(), &[1000, 65535, 0]);

        let bytes = vec![7u8, 255];
        let array = decode_binary(ImageElementType::Double, ImageElementType::Byte, vec![1, 2], &bytes).unwrap();
        assert_eq!(array.as_f64().unwrap(), &[7.0, 255.0]);
    }

    #[test]
    fn test_narrowing_transmission_is_rejected() {
        let bytes = vec![0u8; 8];
        assert_eq!(
            decode_binary(ImageElementType::Int16, ImageElementType::Int32, vec![1, 2], &bytes),
            Err(CodecError::UnsupportedTransmission {
                image: ImageElementType::Int16,
                transmission: ImageElementType::Int32
            })
        );
    }

    #[test]
    fn test_handoff_descriptor() {
        let body = json!({
            "Type": 1,
            "Rank": 3,
            "Dimension0Length": 2,
            "Dimension1Length": 1,
            "Dimension2Length": 3,
            "ErrorNumber": 0,
            "ErrorMessage": ""
        });
        let envelope = Envelope::parse(body.to_string().as_bytes(), JsonCasing::Tolerant).unwrap();
        let descriptor = HandOffDescriptor::from_envelope(&envelope).unwrap();
        assert_eq!(descriptor.element_type, ImageElementType::Int16);
        assert_eq!(descriptor.dimensions, vec![2, 1, 3]);

        let array = ImageArray::new(vec![2, 1, 3], ImageData::Int16(vec![1, -2, 3, -4, 5, -6])).unwrap();
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        let text = format!("  {}\n", BASE64.encode(array.to_le_bytes()));
        assert_eq!(descriptor.decode_payload(text.as_bytes()).unwrap(), array);

        let short = BASE64.encode([0u8; 10]);
        assert!(matches!(
            descriptor.decode_payload(short.as_bytes()),
            Err(CodecError::LengthMismatch { expected: 12, actual: 10 })
        ));
        assert!(matches!(descriptor.decode_payload(b"***"), Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_transfer_mode_precedence() {
        assert_eq!(
            TransferMode::select(Some("application/imagebytes"), true).unwrap(),
            TransferMode::ImageBytes
        );
        assert_eq!(
            TransferMode::select(Some("application/json; charset=utf-8"), true).unwrap(),
            TransferMode::Base64HandOff
        );
        assert_eq!(TransferMode::select(Some("Application/JSON"), false).unwrap(), TransferMode::Json);
        assert_eq!(TransferMode::select(None, true), Err(CodecError::MissingContentType));
        assert!(matches!(
            TransferMode::select(Some("text/html"), false),
            Err(CodecError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_request_headers() {
        let headers = ImageArrayTransferType::BestAvailable.request_headers();
        assert!(headers.contains(&("Accept".to_string(), "application/imagebytes, application/json".to_string())));
        assert!(headers.contains(&("base64handoff".to_string(), "true".to_string())));

        let headers = ImageArrayTransferType::Json.request_headers();
        assert_eq!(headers, vec![("Accept".to_string(), "application/json".to_string())]);
    }

    #[test]
    fn test_variant_array() {
        for array in sample_arrays() {
            let variants = array.to_variant_array();
            assert_eq!(variants.dimensions, array.dimensions());
            assert_eq!(variants.values.len(), array.len());
            let last: Vec<usize> = array.dimensions().iter().map(|d| d - 1).collect();
            assert_eq!(variants.values.last().copied(), array.get(&last));
        }
    }

    #[test]
    fn test_element_type_codes() {
        for code in 0..=9 {
            assert_eq!(ImageElementType::from_code(code).unwrap().code(), code);
        }
        assert!(ImageElementType::from_code(10).is_err());
        assert_eq!(ImageElementType::Double.size(), Some(8));
        assert_eq!(ImageElementType::Unknown.size(), None);
    }
}
