//! Alpaca response envelope and typed value decoding

use crate::{imagearray, translate, AlpacaError, CodecError, ImageArray};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How JSON field names are matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JsonCasing {
    /// Exact ASCOM PascalCase names only
    Strict,
    /// ASCII case-insensitive matching
    #[default]
    Tolerant,
}

/// Shape of the `Value` a call is declared to return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// Methods and property setters
    None,
    Bool,
    Int16,
    Int32,
    Int32List,
    /// Sent as a double, narrowed on decode
    Float,
    Double,
    String,
    StringList,
    StateList,
    AxisRates,
    ImageArray,
}

/// One entry of a `devicestate` response
#[derive(Debug, Clone, PartialEq)]
pub struct StateValue {
    pub name: String,
    pub value: Value,
}

/// One entry of an `axisrates` response
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRate {
    pub minimum: f64,
    pub maximum: f64,
}

/// A decoded response value
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseValue {
    None,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int32List(Vec<i32>),
    Float(f32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    StateList(Vec<StateValue>),
    AxisRates(Vec<AxisRate>),
    ImageArray(ImageArray),
}

impl ResponseValue {
    pub fn response_type(&self) -> ResponseType {
        match self {
            ResponseValue::None => ResponseType::None,
            ResponseValue::Bool(_) => ResponseType::Bool,
            ResponseValue::Int16(_) => ResponseType::Int16,
            ResponseValue::Int32(_) => ResponseType::Int32,
            ResponseValue::Int32List(_) => ResponseType::Int32List,
            ResponseValue::Float(_) => ResponseType::Float,
            ResponseValue::Double(_) => ResponseType::Double,
            ResponseValue::String(_) => ResponseType::String,
            ResponseValue::StringList(_) => ResponseType::StringList,
            ResponseValue::StateList(_) => ResponseType::StateList,
            ResponseValue::AxisRates(_) => ResponseType::AxisRates,
            ResponseValue::ImageArray(_) => ResponseType::ImageArray,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResponseValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, widening Int16
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ResponseValue::Int16(v) => Some(i32::from(*v)),
            ResponseValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point value, widening Float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResponseValue::Float(v) => Some(f64::from(*v)),
            ResponseValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            ResponseValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_string_list(self) -> Option<Vec<String>> {
        match self {
            ResponseValue::StringList(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_int32_list(self) -> Option<Vec<i32>> {
        match self {
            ResponseValue::Int32List(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_state_list(self) -> Option<Vec<StateValue>> {
        match self {
            ResponseValue::StateList(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_axis_rates(self) -> Option<Vec<AxisRate>> {
        match self {
            ResponseValue::AxisRates(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_image_array(self) -> Option<ImageArray> {
        match self {
            ResponseValue::ImageArray(v) => Some(v),
            _ => None,
        }
    }
}

/// Look up a field of a JSON object under the given casing rules
pub fn lookup<'a>(object: &'a Map<String, Value>, name: &str, casing: JsonCasing) -> Option<&'a Value> {
    match casing {
        JsonCasing::Strict => object.get(name),
        JsonCasing::Tolerant => object
            .get(name)
            .or_else(|| object.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v)),
    }
}

/// The common Alpaca response envelope
#[derive(Debug, Clone)]
pub struct Envelope {
    fields: Map<String, Value>,
    casing: JsonCasing,
}

impl Envelope {
    /// Parse a JSON body. The top level must be an object.
    pub fn parse(body: &[u8], casing: JsonCasing) -> Result<Self, CodecError> {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => Ok(Self { fields, casing }),
            Ok(other) => Err(CodecError::InvalidEnvelope(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(CodecError::InvalidEnvelope(format!("invalid JSON: {}", e))),
        }
    }

    pub fn casing(&self) -> JsonCasing {
        self.casing
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        lookup(&self.fields, name, self.casing)
    }

    pub fn value(&self) -> Option<&Value> {
        self.field("Value")
    }

    /// 0 when absent or null.
    ///
    /// Unsigned HRESULTs above `i32::MAX` keep their bit pattern, and floats
    /// are accepted when they carry an integral value.
    pub fn error_number(&self) -> Result<i32, CodecError> {
        let value = match self.field("ErrorNumber") {
            None | Some(Value::Null) => return Ok(0),
            Some(value) => value,
        };
        let invalid = || CodecError::InvalidField {
            field: "ErrorNumber",
            detail: format!("{} is not a 32-bit error number", value),
        };

        let number = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        i32::try_from(number)
            .or_else(|_| u32::try_from(number).map(|n| n as i32))
            .map_err(|_| invalid())
    }

    /// Empty when absent
    pub fn error_message(&self) -> &str {
        self.field("ErrorMessage").and_then(Value::as_str).unwrap_or("")
    }

    pub fn client_transaction_id(&self) -> u32 {
        self.id_field("ClientTransactionID")
    }

    pub fn server_transaction_id(&self) -> u32 {
        self.id_field("ServerTransactionID")
    }

    fn id_field(&self, name: &str) -> u32 {
        self.field(name)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Message of an exception object the remote driver embedded, if any
    pub fn driver_exception(&self) -> Option<String> {
        match self.field("DriverException")? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(exception) => Some(
                lookup(exception, "Message", self.casing)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(exception.clone()).to_string()),
            ),
            other => Some(other.to_string()),
        }
    }

    /// Fail if the device reported an error or embedded an exception
    pub fn check(&self, method: &str) -> Result<(), AlpacaError> {
        let number = self
            .error_number()
            .map_err(|e| AlpacaError::malformed(method, e))?;
        let message = self.error_message();
        if number != 0 || !message.is_empty() {
            return Err(AlpacaError::Device {
                method: method.to_string(),
                fault: translate(number, message),
                client_transaction_id: self.client_transaction_id(),
                server_transaction_id: self.server_transaction_id(),
            });
        }
        if let Some(message) = self.driver_exception() {
            return Err(AlpacaError::RemoteDriverFault {
                method: method.to_string(),
                message,
            });
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decode a JSON response body as the declared type.
///
/// Device errors are checked before the value is looked at, so an error
/// envelope with a missing or mistyped `Value` still reports the device error.
pub fn decode_response(
    method: &str,
    response_type: ResponseType,
    body: &[u8],
    casing: JsonCasing,
) -> Result<ResponseValue, AlpacaError> {
    let envelope = Envelope::parse(body, casing).map_err(|reason| AlpacaError::malformed(method, reason))?;
    envelope.check(method)?;
    decode_value(method, response_type, &envelope)
}

/// Decode the `Value` of an envelope that has already passed [`Envelope::check`]
pub fn decode_value(
    method: &str,
    response_type: ResponseType,
    envelope: &Envelope,
) -> Result<ResponseValue, AlpacaError> {
    if response_type == ResponseType::None {
        return Ok(ResponseValue::None);
    }
    if response_type == ResponseType::ImageArray {
        return imagearray::decode_json_envelope(envelope)
            .map(ResponseValue::ImageArray)
            .map_err(|e| AlpacaError::malformed(method, e));
    }

    let value = envelope
        .value()
        .ok_or_else(|| AlpacaError::malformed(method, "missing field 'Value'"))?;
    let mismatch = |expected: &str| {
        AlpacaError::malformed(
            method,
            format!("expected {} in 'Value', got {}", expected, json_kind(value)),
        )
    };
    let casing = envelope.casing();

    let decoded = match response_type {
        ResponseType::Bool => ResponseValue::Bool(value.as_bool().ok_or_else(|| mismatch("a boolean"))?),
        ResponseType::Int16 => ResponseValue::Int16(
            value
                .as_i64()
                .and_then(|n| i16::try_from(n).ok())
                .ok_or_else(|| mismatch("a 16-bit integer"))?,
        ),
        ResponseType::Int32 => ResponseValue::Int32(
            value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| mismatch("a 32-bit integer"))?,
        ),
        ResponseType::Int32List => ResponseValue::Int32List(
            value
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| mismatch("a list of 32-bit integers"))?,
        ),
        ResponseType::Float => {
            ResponseValue::Float(value.as_f64().ok_or_else(|| mismatch("a number"))? as f32)
        }
        ResponseType::Double => ResponseValue::Double(value.as_f64().ok_or_else(|| mismatch("a number"))?),
        ResponseType::String => ResponseValue::String(
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| mismatch("a string"))?,
        ),
        ResponseType::StringList => ResponseValue::StringList(
            value
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| mismatch("a list of strings"))?,
        ),
        ResponseType::StateList => ResponseValue::StateList(
            value
                .as_array()
                .and_then(|items| items.iter().map(|v| state_value(v, casing)).collect::<Option<Vec<_>>>())
                .ok_or_else(|| mismatch("a list of Name/Value pairs"))?,
        ),
        ResponseType::AxisRates => ResponseValue::AxisRates(
            value
                .as_array()
                .and_then(|items| items.iter().map(|v| axis_rate(v, casing)).collect::<Option<Vec<_>>>())
                .ok_or_else(|| mismatch("a list of Minimum/Maximum pairs"))?,
        ),
        ResponseType::None | ResponseType::ImageArray => unreachable!("handled above"),
    };
    Ok(decoded)
}

fn state_value(value: &Value, casing: JsonCasing) -> Option<StateValue> {
    let object = value.as_object()?;
    Some(StateValue {
        name: lookup(object, "Name", casing)?.as_str()?.to_string(),
        value: lookup(object, "Value", casing)?.clone(),
    })
}

fn axis_rate(value: &Value, casing: JsonCasing) -> Option<AxisRate> {
    let object = value.as_object()?;
    Some(AxisRate {
        minimum: lookup(object, "Minimum", casing)?.as_f64()?,
        maximum: lookup(object, "Maximum", casing)?.as_f64()?,
    })
}
