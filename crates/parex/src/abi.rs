//! Method-signature encoding for contract metadata exchange.
//!
//! Each contract method is serialized as a fixed-shape MessagePack record:
//! `[type, name, flags, indexed_count, inputs[], output?]`. An input is
//! `[name, type, default-or-nil]` in short form or
//! `[name, descriptor, type, default-or-nil]` in long form. An input marked
//! optional carries a type-appropriate zero default (the two's-complement
//! byte string of integer zero for numeric and boolean types) where a
//! required input carries nil. The output array is empty for void methods;
//! otherwise it declares the return type, followed in long form by a type
//! descriptor string.
//!
//! This format is independent of the execution core and consumed alongside
//! it.

use std::io::{Cursor, Read};

use alloy_primitives::Bytes;
use rmp::Marker;

/// Method kind discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MethodType {
    Function = 0,
    Fallback = 1,
    Event = 2,
}

impl MethodType {
    fn from_u32(value: u32) -> Result<Self, AbiError> {
        match value {
            0 => Ok(MethodType::Function),
            1 => Ok(MethodType::Fallback),
            2 => Ok(MethodType::Event),
            other => Err(AbiError::UnknownMethodType(other)),
        }
    }
}

impl std::fmt::Display for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodType::Function => write!(f, "function"),
            MethodType::Fallback => write!(f, "fallback"),
            MethodType::Event => write!(f, "event"),
        }
    }
}

/// Parameter and return data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    Integer = 1,
    String = 2,
    Bytes = 3,
    Bool = 4,
    Address = 5,
}

impl DataType {
    fn from_u32(value: u32) -> Result<Self, AbiError> {
        match value {
            1 => Ok(DataType::Integer),
            2 => Ok(DataType::String),
            3 => Ok(DataType::Bytes),
            4 => Ok(DataType::Bool),
            5 => Ok(DataType::Address),
            other => Err(AbiError::UnknownDataType(other)),
        }
    }

    /// Zero default encoded for an optional input of this type. Only numeric
    /// and boolean types have a byte-string zero; the rest stay nil.
    fn zero_default(self) -> Option<Bytes> {
        match self {
            DataType::Integer | DataType::Bool => Some(Bytes::from_static(&[0])),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Integer => write!(f, "int"),
            DataType::String => write!(f, "str"),
            DataType::Bytes => write!(f, "bytes"),
            DataType::Bool => write!(f, "bool"),
            DataType::Address => write!(f, "Address"),
        }
    }
}

pub const FLAG_READ_ONLY: u32 = 1 << 0;
pub const FLAG_EXTERNAL: u32 = 1 << 1;
pub const FLAG_PAYABLE: u32 = 1 << 2;

/// Codec failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("unknown method type {0}")]
    UnknownMethodType(u32),
    #[error("unknown data type {0}")]
    UnknownDataType(u32),
}

fn enc(err: impl std::fmt::Display) -> AbiError {
    AbiError::Encode(err.to_string())
}

fn dec(err: impl std::fmt::Display) -> AbiError {
    AbiError::Decode(err.to_string())
}

/// One method input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    /// Extra type descriptor, serialized in long form only.
    pub descriptor: Option<String>,
    pub data_type: DataType,
    /// Present for optional parameters of numeric/boolean type; the wire
    /// format carries nil for everything else, so only those survive a
    /// round-trip as optional.
    pub default: Option<Bytes>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            descriptor: None,
            data_type,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            descriptor: None,
            data_type,
            default: data_type.zero_default(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = Some(descriptor.into());
        self
    }

    pub fn is_optional(&self) -> bool {
        self.default.is_some()
    }
}

/// A contract method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub kind: MethodType,
    pub name: String,
    pub flags: u32,
    /// Number of indexed parameters; meaningful for events.
    pub indexed: u32,
    pub inputs: Vec<Parameter>,
    pub output: Option<DataType>,
    /// Return type descriptor, serialized in long form only.
    pub output_descriptor: Option<String>,
}

impl Method {
    pub fn is_payable(&self) -> bool {
        self.kind != MethodType::Event && self.flags & FLAG_PAYABLE != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == MethodType::Function && self.flags & FLAG_READ_ONLY != 0
    }

    pub fn is_external(&self) -> bool {
        self.kind == MethodType::Function && self.flags & FLAG_EXTERNAL != 0
    }

    /// Serialize the descriptor record. Long form adds per-parameter and
    /// return-type descriptor strings.
    pub fn encode(&self, long_form: bool) -> Result<Vec<u8>, AbiError> {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 6).map_err(enc)?;
        rmp::encode::write_uint(&mut buf, self.kind as u64).map_err(enc)?;
        rmp::encode::write_str(&mut buf, &self.name).map_err(enc)?;
        rmp::encode::write_uint(&mut buf, self.flags as u64).map_err(enc)?;
        rmp::encode::write_uint(&mut buf, self.indexed as u64).map_err(enc)?;

        rmp::encode::write_array_len(&mut buf, self.inputs.len() as u32).map_err(enc)?;
        for input in &self.inputs {
            if long_form {
                rmp::encode::write_array_len(&mut buf, 4).map_err(enc)?;
                rmp::encode::write_str(&mut buf, &input.name).map_err(enc)?;
                rmp::encode::write_str(&mut buf, input.descriptor.as_deref().unwrap_or(""))
                    .map_err(enc)?;
            } else {
                rmp::encode::write_array_len(&mut buf, 3).map_err(enc)?;
                rmp::encode::write_str(&mut buf, &input.name).map_err(enc)?;
            }
            rmp::encode::write_uint(&mut buf, input.data_type as u64).map_err(enc)?;
            match &input.default {
                Some(default) => rmp::encode::write_bin(&mut buf, default).map_err(enc)?,
                None => rmp::encode::write_nil(&mut buf).map_err(enc)?,
            }
        }

        match self.output {
            Some(output) => {
                rmp::encode::write_array_len(&mut buf, 1).map_err(enc)?;
                rmp::encode::write_uint(&mut buf, output as u64).map_err(enc)?;
                if long_form {
                    rmp::encode::write_str(&mut buf, self.output_descriptor.as_deref().unwrap_or(""))
                        .map_err(enc)?;
                }
            }
            None => {
                rmp::encode::write_array_len(&mut buf, 0).map_err(enc)?;
            }
        }
        Ok(buf)
    }

    /// Deserialize a descriptor record, accepting both forms.
    pub fn decode(data: &[u8]) -> Result<Self, AbiError> {
        let mut rd = Cursor::new(data);

        let top = rmp::decode::read_array_len(&mut rd).map_err(dec)?;
        if top != 6 {
            return Err(AbiError::Decode(format!(
                "expected 6-element method record, got {top}"
            )));
        }
        let kind = MethodType::from_u32(read_u32(&mut rd)?)?;
        let name = read_string(&mut rd)?;
        let flags = read_u32(&mut rd)?;
        let indexed = read_u32(&mut rd)?;

        let num_inputs = rmp::decode::read_array_len(&mut rd).map_err(dec)?;
        let mut inputs = Vec::with_capacity(num_inputs as usize);
        for _ in 0..num_inputs {
            let shape = rmp::decode::read_array_len(&mut rd).map_err(dec)?;
            let (name, descriptor) = match shape {
                3 => (read_string(&mut rd)?, None),
                4 => {
                    let name = read_string(&mut rd)?;
                    let descriptor = read_string(&mut rd)?;
                    (name, Some(descriptor))
                }
                other => {
                    return Err(AbiError::Decode(format!(
                        "expected 3- or 4-element input, got {other}"
                    )))
                }
            };
            let data_type = DataType::from_u32(read_u32(&mut rd)?)?;
            let default = read_default(&mut rd)?;
            inputs.push(Parameter {
                name,
                descriptor,
                data_type,
                default,
            });
        }

        let out_len = rmp::decode::read_array_len(&mut rd).map_err(dec)?;
        let (output, output_descriptor) = match out_len {
            0 => (None, None),
            1 => {
                let output = DataType::from_u32(read_u32(&mut rd)?)?;
                // long form appends the descriptor after the declared element
                let descriptor = if (rd.position() as usize) < data.len() {
                    Some(read_string(&mut rd)?)
                } else {
                    None
                };
                (Some(output), descriptor)
            }
            other => {
                return Err(AbiError::Decode(format!(
                    "expected 0- or 1-element output, got {other}"
                )))
            }
        };

        Ok(Method {
            kind,
            name,
            flags,
            indexed,
            inputs,
            output,
            output_descriptor,
        })
    }
}

fn read_u32(rd: &mut Cursor<&[u8]>) -> Result<u32, AbiError> {
    rmp::decode::read_int(rd).map_err(dec)
}

fn read_string(rd: &mut Cursor<&[u8]>) -> Result<String, AbiError> {
    let len = rmp::decode::read_str_len(rd).map_err(dec)? as usize;
    let mut buf = vec![0u8; len];
    rd.read_exact(&mut buf).map_err(dec)?;
    String::from_utf8(buf).map_err(dec)
}

fn read_default(rd: &mut Cursor<&[u8]>) -> Result<Option<Bytes>, AbiError> {
    let pos = rd.position();
    let mut first = [0u8; 1];
    rd.read_exact(&mut first).map_err(dec)?;
    if Marker::from_u8(first[0]) == Marker::Null {
        return Ok(None);
    }
    rd.set_position(pos);
    let len = rmp::decode::read_bin_len(rd).map_err(dec)? as usize;
    let mut buf = vec![0u8; len];
    rd.read_exact(&mut buf).map_err(dec)?;
    Ok(Some(Bytes::from(buf)))
}
