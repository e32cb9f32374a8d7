//! Per-kind message payloads: pure encode/decode functions over byte
//! buffers, validated independently of the header.

use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Layer kind carried in a TASK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LayerType {
    Conv = 1,
    Depthwise = 2,
    Pointwise = 3,
    Fc = 4,
}

impl LayerType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LayerType::Conv),
            2 => Ok(LayerType::Depthwise),
            3 => Ok(LayerType::Pointwise),
            4 => Ok(LayerType::Fc),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// REGISTER payload: worker -> coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPayload {
    pub clock_mhz: u32,
}

impl RegisterPayload {
    pub const LEN: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.write_u32::<LittleEndian>(self.clock_mhz).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, Self::LEN)?;
        let mut cursor = Cursor::new(data);
        let clock_mhz = cursor.read_u32::<LittleEndian>().unwrap();
        Ok(Self { clock_mhz })
    }
}

/// REGISTER_ACK payload: coordinator -> worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAckPayload {
    pub status: u8,
    pub assigned_id: u8,
}

impl RegisterAckPayload {
    pub const LEN: usize = 2;

    pub fn encode(&self) -> Vec<u8> {
        vec![self.status, self.assigned_id]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, Self::LEN)?;
        Ok(Self {
            status: data[0],
            assigned_id: data[1],
        })
    }
}

/// TASK payload: fixed struct followed by `input_size` raw uint8 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    pub layer_type: LayerType,
    pub layer_idx: u32,
    pub in_channels: u32,
    pub in_h: u32,
    pub in_w: u32,
    pub out_channels: u32,
    pub out_h: u32,
    pub out_w: u32,
    pub kernel_size: u8,
    pub stride: u8,
    pub padding: u8,
    pub groups: u16,
    pub in_features: u32,
    pub out_features: u32,
    pub input: Vec<u8>,
}

impl TaskPayload {
    /// Size of the fixed struct preceding the raw input bytes.
    pub const FIXED_LEN: usize = 46;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_LEN + self.input.len());
        buf.write_u8(self.layer_type.as_u8()).unwrap();
        buf.write_u32::<LittleEndian>(self.layer_idx).unwrap();
        buf.write_u32::<LittleEndian>(self.in_channels).unwrap();
        buf.write_u32::<LittleEndian>(self.in_h).unwrap();
        buf.write_u32::<LittleEndian>(self.in_w).unwrap();
        buf.write_u32::<LittleEndian>(self.out_channels).unwrap();
        buf.write_u32::<LittleEndian>(self.out_h).unwrap();
        buf.write_u32::<LittleEndian>(self.out_w).unwrap();
        buf.write_u8(self.kernel_size).unwrap();
        buf.write_u8(self.stride).unwrap();
        buf.write_u8(self.padding).unwrap();
        buf.write_u16::<LittleEndian>(self.groups).unwrap();
        buf.write_u32::<LittleEndian>(self.in_features).unwrap();
        buf.write_u32::<LittleEndian>(self.out_features).unwrap();
        buf.write_u32::<LittleEndian>(self.input.len() as u32)
            .unwrap();
        buf.write_all(&self.input).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, Self::FIXED_LEN)?;
        let mut cursor = Cursor::new(data);
        let layer_type = LayerType::from_u8(cursor.read_u8().unwrap())?;
        let layer_idx = cursor.read_u32::<LittleEndian>().unwrap();
        let in_channels = cursor.read_u32::<LittleEndian>().unwrap();
        let in_h = cursor.read_u32::<LittleEndian>().unwrap();
        let in_w = cursor.read_u32::<LittleEndian>().unwrap();
        let out_channels = cursor.read_u32::<LittleEndian>().unwrap();
        let out_h = cursor.read_u32::<LittleEndian>().unwrap();
        let out_w = cursor.read_u32::<LittleEndian>().unwrap();
        let kernel_size = cursor.read_u8().unwrap();
        let stride = cursor.read_u8().unwrap();
        let padding = cursor.read_u8().unwrap();
        let groups = cursor.read_u16::<LittleEndian>().unwrap();
        let in_features = cursor.read_u32::<LittleEndian>().unwrap();
        let out_features = cursor.read_u32::<LittleEndian>().unwrap();
        let input_size = cursor.read_u32::<LittleEndian>().unwrap() as usize;

        let rest = &data[Self::FIXED_LEN..];
        require_len(rest, input_size)?;
        let input = rest[..input_size].to_vec();

        Ok(Self {
            layer_type,
            layer_idx,
            in_channels,
            in_h,
            in_w,
            out_channels,
            out_h,
            out_w,
            kernel_size,
            stride,
            padding,
            groups,
            in_features,
            out_features,
            input,
        })
    }
}

/// RESULT payload: worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPayload {
    pub compute_time_us: u32,
    pub output: Vec<u8>,
}

impl ResultPayload {
    pub const FIXED_LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_LEN + self.output.len());
        buf.write_u32::<LittleEndian>(self.compute_time_us).unwrap();
        buf.write_u32::<LittleEndian>(self.output.len() as u32)
            .unwrap();
        buf.write_all(&self.output).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, Self::FIXED_LEN)?;
        let mut cursor = Cursor::new(data);
        let compute_time_us = cursor.read_u32::<LittleEndian>().unwrap();
        let output_size = cursor.read_u32::<LittleEndian>().unwrap() as usize;

        let rest = &data[Self::FIXED_LEN..];
        require_len(rest, output_size)?;
        let output = rest[..output_size].to_vec();

        Ok(Self {
            compute_time_us,
            output,
        })
    }
}

/// ERROR payload: `error_code` plus a 63-byte NUL-padded UTF-8 description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error_code: u8,
    pub description: String,
}

impl ErrorPayload {
    pub const LEN: usize = 64;
    const DESCRIPTION_LEN: usize = 63;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.push(self.error_code);
        let bytes = self.description.as_bytes();
        let take = bytes.len().min(Self::DESCRIPTION_LEN);
        buf.extend_from_slice(&bytes[..take]);
        buf.resize(Self::LEN, 0);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        require_len(data, Self::LEN)?;
        let error_code = data[0];
        let raw = &data[1..Self::LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let description = String::from_utf8(raw[..end].to_vec())?;
        Ok(Self {
            error_code,
            description,
        })
    }
}

/// HEARTBEAT payload: worker -> coordinator, no body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload;

impl HeartbeatPayload {
    pub fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    pub fn decode(_data: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// SHUTDOWN payload: coordinator -> worker, no body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPayload;

impl ShutdownPayload {
    pub fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    pub fn decode(_data: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

fn require_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(ProtocolError::ShortBuffer {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}
