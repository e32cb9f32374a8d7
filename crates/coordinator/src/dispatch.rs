//! Dispatch Engine (C7): drives one full inference pass, layer by layer.

use crate::error::{CoordinatorError, Result};
use crate::model::{LayerConfig, QuantParams};
use crate::partition::{self, FeatureMap, SliceDescriptor, WorkerTask};
use crate::registry::WorkerRegistry;
use crate::stats::{LayerStats, StatsCollector, WorkerStat};
use crate::transport;
use coordinator_protocol::messages::{ErrorPayload, ResultPayload, ShutdownPayload};
use coordinator_protocol::MessageType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Header/payload timeouts the engine applies while a task is outstanding.
#[derive(Debug, Clone, Copy)]
pub struct TaskTimeouts {
    pub header: Duration,
    pub payload: Duration,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            header: Duration::from_secs(60),
            payload: Duration::from_secs(10),
        }
    }
}

/// A feature map saved at a `residual_add_to` layer, kept until the
/// matching `residual_connect_from` consumes it.
struct ResidualBuffer {
    feature_map: FeatureMap,
    s: f64,
    z: u8,
}

pub struct DispatchEngine {
    registry: Arc<WorkerRegistry>,
    layers: Vec<LayerConfig>,
    quant: Vec<QuantParams>,
    timeouts: TaskTimeouts,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        layers: Vec<LayerConfig>,
        quant: Vec<QuantParams>,
        timeouts: TaskTimeouts,
    ) -> Self {
        Self {
            registry,
            layers,
            quant,
            timeouts,
        }
    }

    /// Quantize a real-valued input tensor into the initial feature map.
    pub fn quantize_input(&self, real: &[f64], shape: (usize, usize, usize)) -> FeatureMap {
        let s_in = self.quant[0].s_in;
        let z_in = self.quant[0].z_in;
        let data = real.iter().map(|&x| quantize(x, s_in, z_in)).collect();
        FeatureMap::Chw {
            c: shape.0,
            h: shape.1,
            w: shape.2,
            data,
        }
    }

    /// Run every configured layer in order against `input`, returning the
    /// final feature map and recording timing into `stats`.
    pub async fn execute_inference(
        &self,
        input: FeatureMap,
        stats: &mut StatsCollector,
    ) -> Result<FeatureMap> {
        let mut feature_map = input;
        let mut residuals: HashMap<String, ResidualBuffer> = HashMap::new();

        for (layer, quant) in self.layers.iter().zip(self.quant.iter()) {
            let layer_start = Instant::now();

            if let Some(tag) = &layer.residual_add_to {
                residuals.insert(
                    tag.clone(),
                    ResidualBuffer {
                        feature_map: feature_map.clone(),
                        s: quant.s_in,
                        z: quant.z_in,
                    },
                );
            }

            if layer.layer_type == coordinator_protocol::messages::LayerType::Fc {
                if let FeatureMap::Chw { .. } = &feature_map {
                    feature_map = global_average_pool(&feature_map);
                }
            }

            let workers = self.registry.snapshot_workers().await;
            let tasks = partition::partition_layer(layer, quant, &feature_map, &workers);

            match self.run_layer(layer, &feature_map, tasks).await {
                Ok((stitched, worker_stats)) => {
                    feature_map = stitched;
                    stats.record_layer(LayerStats {
                        layer_idx: layer.layer_idx,
                        wall_time: layer_start.elapsed(),
                        workers: worker_stats,
                    });
                }
                Err(e) => {
                    self.broadcast_shutdown().await;
                    return Err(e.into_aborted(layer.layer_idx));
                }
            }

            if let Some(tag) = &layer.residual_connect_from {
                let cached = residuals.remove(tag).ok_or_else(|| {
                    CoordinatorError::ShapeMismatch(format!("no residual buffer tagged {tag}"))
                })?;
                let (s_res, z_res) = match (quant.s_residual_out, quant.z_residual_out) {
                    (Some(s), Some(z)) => (s, z),
                    _ => {
                        return Err(CoordinatorError::ConfigInvalid {
                            line: None,
                            reason: format!(
                                "layer {} consumes residual {tag} but has no s_residual_out/z_residual_out",
                                layer.layer_idx
                            ),
                        })
                    }
                };
                feature_map =
                    residual_add(&cached, &feature_map, quant.s_out, quant.z_out, s_res, z_res)?;
            }
        }

        Ok(feature_map)
    }

    /// Send every worker's slice, gather results, stitch into one output
    /// feature map. A single worker fault aborts the whole layer.
    async fn run_layer(
        &self,
        layer: &LayerConfig,
        feature_map: &FeatureMap,
        tasks: Vec<WorkerTask>,
    ) -> Result<(FeatureMap, Vec<WorkerStat>)> {
        let out_shape = layer_output_shape(layer, feature_map);

        let mut join_set: JoinSet<Result<(SliceDescriptor, u8, ResultPayload, Duration, Duration)>> =
            JoinSet::new();

        for task in tasks {
            let registry = self.registry.clone();
            let header_timeout = self.timeouts.header;
            let payload_timeout = self.timeouts.payload;
            join_set.spawn(async move {
                run_worker_task(registry, task, header_timeout, payload_timeout).await
            });
        }

        let mut worker_stats = Vec::new();
        let mut outcomes = Vec::new();
        let mut first_error = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((slice, worker_id, result, send_time, recv_time))) => {
                    worker_stats.push(WorkerStat {
                        worker_id,
                        send_time,
                        recv_time,
                        compute_time: Duration::from_micros(result.compute_time_us as u64),
                    });
                    outcomes.push((slice, result));
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "worker task panicked");
                    if first_error.is_none() {
                        first_error = Some(CoordinatorError::ProtocolViolation(
                            "worker task panicked".to_string(),
                        ));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let stitched = stitch(out_shape, outcomes)?;
        Ok((stitched, worker_stats))
    }

    /// Send SHUTDOWN to every still-registered worker, ignoring individual
    /// send failures. Called on any abort, and again by the orchestrator
    /// once inference completes successfully.
    pub async fn broadcast_shutdown(&self) {
        let workers = self.registry.snapshot_workers().await;
        let payload = ShutdownPayload.encode();
        for worker in workers {
            let mut writer = worker.writer.lock().await;
            if let Err(e) =
                transport::send(&mut writer, MessageType::Shutdown, worker.id(), &payload).await
            {
                warn!(worker_id = worker.id(), error = %e, "shutdown send failed");
            }
        }
    }
}

async fn run_worker_task(
    registry: Arc<WorkerRegistry>,
    task: WorkerTask,
    header_timeout: Duration,
    payload_timeout: Duration,
) -> Result<(SliceDescriptor, u8, ResultPayload, Duration, Duration)> {
    let worker_id = task.worker.id();
    registry.mark_busy(worker_id).await;

    let payload = task.message.encode();

    let send_start = Instant::now();
    {
        let mut writer = task.worker.writer.lock().await;
        if let Err(e) = transport::send(&mut writer, MessageType::Task, worker_id, &payload).await {
            registry.disconnect(worker_id).await;
            return Err(e);
        }
    }
    let send_time = send_start.elapsed();

    let recv_start = Instant::now();
    let (header, body) = {
        let mut reader = task.worker.reader.lock().await;
        match transport::recv(&mut reader, header_timeout, payload_timeout).await {
            Ok(frame) => frame,
            Err(e) => {
                registry.disconnect(worker_id).await;
                return Err(e);
            }
        }
    };
    let recv_time = recv_start.elapsed();

    let result = match header.msg_type {
        MessageType::Result => match ResultPayload::decode(&body) {
            Ok(result) => result,
            Err(e) => {
                registry.disconnect(worker_id).await;
                return Err(e.into());
            }
        },
        MessageType::Error => {
            let err = ErrorPayload::decode(&body)?;
            return Err(CoordinatorError::WorkerError {
                worker_id,
                code: err.error_code,
                description: err.description,
            });
        }
        other => {
            registry.disconnect(worker_id).await;
            return Err(CoordinatorError::ProtocolViolation(format!(
                "worker {worker_id} sent unexpected message type {other:?} for a TASK response"
            )));
        }
    };

    registry.mark_idle(worker_id).await;
    Ok((task.slice, worker_id, result, send_time, recv_time))
}

fn layer_output_shape(layer: &LayerConfig, feature_map: &FeatureMap) -> OutputShape {
    match layer.layer_type {
        coordinator_protocol::messages::LayerType::Fc => OutputShape::Flat {
            n: layer.out_channels as usize,
        },
        _ => {
            let (_c, h, w) = match feature_map {
                FeatureMap::Chw { c, h, w, .. } => (*c, *h, *w),
                FeatureMap::Flat { .. } => {
                    unreachable!("conv-family layer must follow a 3D feature map")
                }
            };
            let padded_h = h + 2 * layer.padding as usize;
            let padded_w = w + 2 * layer.padding as usize;
            let h_out = (padded_h - layer.kernel_size as usize) / layer.stride as usize + 1;
            let w_out = (padded_w - layer.kernel_size as usize) / layer.stride as usize + 1;
            OutputShape::Chw {
                c: layer.out_channels as usize,
                h: h_out,
                w: w_out,
            }
        }
    }
}

enum OutputShape {
    Chw { c: usize, h: usize, w: usize },
    Flat { n: usize },
}

fn stitch(shape: OutputShape, outcomes: Vec<(SliceDescriptor, ResultPayload)>) -> Result<FeatureMap> {
    match shape {
        OutputShape::Chw { c, h, w } => {
            let mut out = vec![0u8; c * h * w];
            for (slice, result) in outcomes {
                let (r0, r1) = match slice {
                    SliceDescriptor::Rows { r0, r1 } => (r0, r1),
                    SliceDescriptor::Classes { .. } => {
                        return Err(CoordinatorError::ShapeMismatch(
                            "class slice returned for a conv-family layer".to_string(),
                        ))
                    }
                };
                let rows = r1 - r0;
                if result.output.len() != c * rows * w {
                    return Err(CoordinatorError::ShapeMismatch(format!(
                        "expected {} output bytes for rows [{r0},{r1}), got {}",
                        c * rows * w,
                        result.output.len()
                    )));
                }
                for ch in 0..c {
                    let src_off = ch * rows * w;
                    let dst_off = (ch * h + r0) * w;
                    out[dst_off..dst_off + rows * w]
                        .copy_from_slice(&result.output[src_off..src_off + rows * w]);
                }
            }
            Ok(FeatureMap::Chw { c, h, w, data: out })
        }
        OutputShape::Flat { n } => {
            let mut out = vec![0u8; n];
            for (slice, result) in outcomes {
                let (c0, c1) = match slice {
                    SliceDescriptor::Classes { c0, c1 } => (c0, c1),
                    SliceDescriptor::Rows { .. } => {
                        return Err(CoordinatorError::ShapeMismatch(
                            "row slice returned for an FC layer".to_string(),
                        ))
                    }
                };
                if result.output.len() != c1 - c0 {
                    return Err(CoordinatorError::ShapeMismatch(format!(
                        "expected {} output bytes for classes [{c0},{c1}), got {}",
                        c1 - c0,
                        result.output.len()
                    )));
                }
                out[c0..c1].copy_from_slice(&result.output);
            }
            Ok(FeatureMap::Flat { data: out })
        }
    }
}

/// `q = clip(round(x / s + z), 0, 255)`.
fn quantize(x: f64, s: f64, z: u8) -> u8 {
    let q = (x / s + z as f64).round();
    q.clamp(0.0, 255.0) as u8
}

/// `x = (q - z) * s`.
fn dequantize(q: u8, s: f64, z: u8) -> f64 {
    (q as f64 - z as f64) * s
}

/// Per-channel mean over H, W, rounded to nearest integer and clipped to
/// [0,255] — the GAP step applied immediately before an FC layer.
fn global_average_pool(feature_map: &FeatureMap) -> FeatureMap {
    let (c, h, w, data) = match feature_map {
        FeatureMap::Chw { c, h, w, data } => (*c, *h, *w, data),
        FeatureMap::Flat { .. } => unreachable!("GAP only applies to a 3D feature map"),
    };
    let mut out = Vec::with_capacity(c);
    for ch in 0..c {
        let start = ch * h * w;
        let sum: u64 = data[start..start + h * w].iter().map(|&v| v as u64).sum();
        let mean = sum as f64 / (h * w) as f64;
        out.push(mean.round().clamp(0.0, 255.0) as u8);
    }
    FeatureMap::Flat { data: out }
}

/// Requantize the sum of a cached residual and the current feature map
/// into the layer's residual output domain.
fn residual_add(
    cached: &ResidualBuffer,
    current: &FeatureMap,
    s_y: f64,
    z_y: u8,
    s_res: f64,
    z_res: u8,
) -> Result<FeatureMap> {
    match (&cached.feature_map, current) {
        (
            FeatureMap::Chw {
                c: c1,
                h: h1,
                w: w1,
                data: x,
            },
            FeatureMap::Chw {
                c: c2,
                h: h2,
                w: w2,
                data: y,
            },
        ) => {
            if c1 != c2 || h1 != h2 || w1 != w2 {
                return Err(CoordinatorError::ShapeMismatch(format!(
                    "residual shape ({c1},{h1},{w1}) != current shape ({c2},{h2},{w2})"
                )));
            }
            let data = add_quantized(x, cached.s, cached.z, y, s_y, z_y, s_res, z_res)?;
            Ok(FeatureMap::Chw {
                c: *c2,
                h: *h2,
                w: *w2,
                data,
            })
        }
        (FeatureMap::Flat { data: x }, FeatureMap::Flat { data: y }) => {
            if x.len() != y.len() {
                return Err(CoordinatorError::ShapeMismatch(format!(
                    "residual length {} != current length {}",
                    x.len(),
                    y.len()
                )));
            }
            let data = add_quantized(x, cached.s, cached.z, y, s_y, z_y, s_res, z_res)?;
            Ok(FeatureMap::Flat { data })
        }
        _ => Err(CoordinatorError::ShapeMismatch(
            "residual buffer and current feature map have different ranks".to_string(),
        )),
    }
}

#[allow(clippy::too_many_arguments)]
fn add_quantized(
    x_q: &[u8],
    s_x: f64,
    z_x: u8,
    y_q: &[u8],
    s_y: f64,
    z_y: u8,
    s_res: f64,
    z_res: u8,
) -> Result<Vec<u8>> {
    Ok(x_q
        .iter()
        .zip(y_q.iter())
        .map(|(&xq, &yq)| {
            let x_f = dequantize(xq, s_x, z_x);
            let y_f = dequantize(yq, s_y, z_y);
            quantize(x_f + y_f, s_res, z_res)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerRegistry;

    fn sample_quant() -> QuantParams {
        QuantParams {
            s_in: 0.1,
            z_in: 100,
            s_w: vec![1.0],
            z_w: vec![0],
            m: vec![1.0],
            s_out: 0.1,
            z_out: 100,
            s_residual_out: None,
            z_residual_out: None,
        }
    }

    #[test]
    fn quantize_input_applies_first_layer_scale_and_zero_point() {
        let engine = DispatchEngine::new(
            Arc::new(WorkerRegistry::new()),
            Vec::new(),
            vec![sample_quant()],
            TaskTimeouts::default(),
        );
        let fm = engine.quantize_input(&[0.0, 1.0, -1.0], (1, 1, 3));
        match fm {
            FeatureMap::Chw { data, .. } => assert_eq!(data, vec![100, 110, 90]),
            _ => panic!("expected chw output"),
        }
    }

    #[test]
    fn quantize_round_trip_within_one_scale() {
        let s = 0.05;
        let z = 128u8;
        for x in [-6.0, -0.1, 0.0, 1.23, 6.0] {
            let q = quantize(x, s, z);
            let back = dequantize(q, s, z);
            assert!((back - x).abs() <= s + 1e-9);
        }
    }

    #[test]
    fn global_average_pool_matches_hand_computed_mean() {
        let fm = FeatureMap::Chw {
            c: 2,
            h: 2,
            w: 2,
            data: vec![10, 10, 10, 10, 20, 20, 20, 20],
        };
        let pooled = global_average_pool(&fm);
        match pooled {
            FeatureMap::Flat { data } => assert_eq!(data, vec![10, 20]),
            _ => panic!("expected flat output"),
        }
    }

    #[test]
    fn residual_add_matches_worked_example() {
        let cached = ResidualBuffer {
            feature_map: FeatureMap::Flat { data: vec![200] },
            s: 0.1,
            z: 100,
        };
        let current = FeatureMap::Flat { data: vec![150] };
        let out = residual_add(&cached, &current, 0.05, 120, 0.2, 128).unwrap();
        match out {
            FeatureMap::Flat { data } => assert_eq!(data, vec![186]),
            _ => panic!("expected flat output"),
        }
    }

    #[test]
    fn stitch_conv_rows_covers_full_output_with_no_overlap() {
        let outcomes = vec![
            (
                SliceDescriptor::Rows { r0: 0, r1: 2 },
                ResultPayload {
                    compute_time_us: 0,
                    output: vec![1, 1, 1, 1, 1, 1, 1, 1],
                },
            ),
            (
                SliceDescriptor::Rows { r0: 2, r1: 4 },
                ResultPayload {
                    compute_time_us: 0,
                    output: vec![2, 2, 2, 2, 2, 2, 2, 2],
                },
            ),
        ];
        let out = stitch(OutputShape::Chw { c: 1, h: 4, w: 2 }, outcomes).unwrap();
        match out {
            FeatureMap::Chw { data, .. } => {
                assert_eq!(data, vec![1, 1, 1, 1, 2, 2, 2, 2]);
            }
            _ => panic!("expected chw output"),
        }
    }

    #[test]
    fn stitch_fc_classes_covers_full_output() {
        let outcomes = vec![
            (
                SliceDescriptor::Classes { c0: 0, c1: 5 },
                ResultPayload {
                    compute_time_us: 0,
                    output: vec![1, 2, 3, 4, 5],
                },
            ),
            (
                SliceDescriptor::Classes { c0: 5, c1: 10 },
                ResultPayload {
                    compute_time_us: 0,
                    output: vec![6, 7, 8, 9, 10],
                },
            ),
        ];
        let out = stitch(OutputShape::Flat { n: 10 }, outcomes).unwrap();
        match out {
            FeatureMap::Flat { data } => {
                assert_eq!(data, (1..=10).collect::<Vec<u8>>());
            }
            _ => panic!("expected flat output"),
        }
    }
}
