//! Model Config Loader (C5): parses the layer list and quantization
//! parameters JSON document into in-memory records.

use crate::error::{CoordinatorError, Result};
use coordinator_protocol::messages::LayerType;
use serde_json::Value;
use std::path::Path;

/// Immutable description of one network layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub name: String,
    pub layer_type: LayerType,
    pub layer_idx: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub kernel_size: u8,
    pub stride: u8,
    pub padding: u8,
    pub groups: u16,
    pub residual_add_to: Option<String>,
    pub residual_connect_from: Option<String>,
}

/// Per-layer affine quantization parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub s_in: f64,
    pub z_in: u8,
    pub s_w: Vec<f64>,
    pub z_w: Vec<i64>,
    /// Precomputed requantization multiplier `s_in * s_w / s_out`, per
    /// output channel.
    pub m: Vec<f64>,
    pub s_out: f64,
    pub z_out: u8,
    pub s_residual_out: Option<f64>,
    pub z_residual_out: Option<u8>,
}

/// Load and validate the model config JSON at `path`.
///
/// `layer_idx` is assigned from array position; the file's ordering is
/// authoritative.
pub fn load_model_config(path: &Path) -> Result<(Vec<LayerConfig>, Vec<QuantParams>)> {
    let text = std::fs::read_to_string(path)?;
    parse_model_config(&text)
}

pub fn parse_model_config(text: &str) -> Result<(Vec<LayerConfig>, Vec<QuantParams>)> {
    let doc: Value = serde_json::from_str(text).map_err(|e| CoordinatorError::ConfigInvalid {
        line: Some(e.line()),
        reason: e.to_string(),
    })?;

    let layers = doc
        .get("layers")
        .and_then(Value::as_array)
        .ok_or_else(|| config_invalid("missing top-level \"layers\" array"))?;

    let mut layer_configs = Vec::with_capacity(layers.len());
    let mut quant_params = Vec::with_capacity(layers.len());

    for (idx, entry) in layers.iter().enumerate() {
        let layer_json = entry
            .get("layer_config")
            .ok_or_else(|| config_invalid(&format!("layer {idx}: missing \"layer_config\"")))?;
        let quant_json = entry
            .get("quant_params")
            .ok_or_else(|| config_invalid(&format!("layer {idx}: missing \"quant_params\"")))?;

        layer_configs.push(parse_layer_config(layer_json, idx as u32)?);
        quant_params.push(parse_quant_params(quant_json, idx)?);
    }

    Ok((layer_configs, quant_params))
}

fn parse_layer_config(value: &Value, layer_idx: u32) -> Result<LayerConfig> {
    let name = get_str(value, "name")?.to_string();
    let layer_type = parse_layer_type(
        value
            .get("type")
            .ok_or_else(|| config_invalid(&format!("layer {layer_idx} ({name}): missing \"type\"")))?,
        &name,
    )?;

    let in_channels = get_u32(value, "in_channels")?;
    let out_channels = get_u32(value, "out_channels")?;
    let kernel_size = get_bounded_u8(value, "kernel_size")?;
    let stride = get_bounded_u8(value, "stride")?;
    let padding = get_bounded_u8(value, "padding")?;
    let groups = get_bounded_u16(value, "groups")?;
    let residual_add_to = get_opt_str(value, "residual_add_to");
    let residual_connect_from = get_opt_str(value, "residual_connect_from");

    Ok(LayerConfig {
        name,
        layer_type,
        layer_idx,
        in_channels,
        out_channels,
        kernel_size,
        stride,
        padding,
        groups,
        residual_add_to,
        residual_connect_from,
    })
}

fn parse_quant_params(value: &Value, layer_idx: usize) -> Result<QuantParams> {
    let s_in = get_f64(value, "s_in")?;
    let z_in = get_bounded_u8(value, "z_in")?;
    let s_w = get_f64_array(value, "s_w")?;
    let z_w = get_i64_array(value, "z_w")?;
    let m = get_f64_array(value, "m")?;
    let s_out = get_f64(value, "s_out")?;
    let z_out = get_bounded_u8(value, "z_out")?;

    let s_residual_out = value.get("s_residual_out").and_then(Value::as_f64);
    let z_residual_out = value
        .get("z_residual_out")
        .and_then(Value::as_i64)
        .map(|v| v as u8);

    let _ = layer_idx; // reserved for richer error context if the format grows
    Ok(QuantParams {
        s_in,
        z_in,
        s_w,
        z_w,
        m,
        s_out,
        z_out,
        s_residual_out,
        z_residual_out,
    })
}

fn parse_layer_type(value: &Value, layer_name: &str) -> Result<LayerType> {
    if let Some(s) = value.as_str() {
        return match s.to_ascii_uppercase().as_str() {
            "CONV" => Ok(LayerType::Conv),
            "DEPTHWISE" => Ok(LayerType::Depthwise),
            "POINTWISE" => Ok(LayerType::Pointwise),
            "FC" => Ok(LayerType::Fc),
            other => Err(config_invalid(&format!(
                "layer {layer_name}: unrecognized layer type \"{other}\""
            ))),
        };
    }
    if let Some(n) = value.as_u64() {
        return LayerType::from_u8(n as u8).map_err(|_| {
            config_invalid(&format!("layer {layer_name}: unrecognized layer type {n}"))
        });
    }
    Err(config_invalid(&format!(
        "layer {layer_name}: \"type\" must be a string or integer"
    )))
}

fn config_invalid(reason: &str) -> CoordinatorError {
    CoordinatorError::ConfigInvalid {
        line: None,
        reason: reason.to_string(),
    }
}

fn get_str<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| config_invalid(&format!("missing or non-string field \"{field}\"")))
}

fn get_opt_str(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn get_u32(value: &Value, field: &str) -> Result<u32> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| config_invalid(&format!("missing or non-integer field \"{field}\"")))
}

fn get_bounded_u8(value: &Value, field: &str) -> Result<u8> {
    let n = get_u32(value, field)?;
    u8::try_from(n).map_err(|_| config_invalid(&format!("field \"{field}\" out of range: {n}")))
}

fn get_bounded_u16(value: &Value, field: &str) -> Result<u16> {
    let n = get_u32(value, field)?;
    u16::try_from(n).map_err(|_| config_invalid(&format!("field \"{field}\" out of range: {n}")))
}

fn get_f64(value: &Value, field: &str) -> Result<f64> {
    value
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| config_invalid(&format!("missing or non-numeric field \"{field}\"")))
}

fn get_f64_array(value: &Value, field: &str) -> Result<Vec<f64>> {
    value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| config_invalid(&format!("missing or non-array field \"{field}\"")))?
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| config_invalid(&format!("non-numeric entry in \"{field}\"")))
        })
        .collect()
}

fn get_i64_array(value: &Value, field: &str) -> Result<Vec<i64>> {
    value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| config_invalid(&format!("missing or non-array field \"{field}\"")))?
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| config_invalid(&format!("non-integer entry in \"{field}\"")))
        })
        .collect()
}
