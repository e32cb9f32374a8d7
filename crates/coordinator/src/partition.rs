//! Layer Partitioner (C6): pure slicing of one layer's work across the
//! currently IDLE/BUSY worker snapshot.

use crate::model::{LayerConfig, QuantParams};
use crate::registry::WorkerHandle;
use coordinator_protocol::messages::{LayerType, TaskPayload};
use std::sync::Arc;

/// Where a worker's output patch lands in the stitched layer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceDescriptor {
    /// Output rows `[r0, r1)`, full width and channels.
    Rows { r0: usize, r1: usize },
    /// Output classes `[c0, c1)`.
    Classes { c0: usize, c1: usize },
}

/// One worker's share of a layer: who runs it, where its output belongs,
/// the task message to send, and the already-sliced input bytes.
pub struct WorkerTask {
    pub worker: Arc<WorkerHandle>,
    pub slice: SliceDescriptor,
    pub message: TaskPayload,
}

/// 3D `(C,H,W)` or 1D `(N,)` activation, canonical row-major contiguous
/// layout, element type uint8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureMap {
    Chw { c: usize, h: usize, w: usize, data: Vec<u8> },
    Flat { data: Vec<u8> },
}

/// Partition one layer's work across `workers`. `workers` must already be
/// the dense, id-sorted snapshot the registry hands out — FC class ranges
/// are indexed by position in this slice, per the positional tie-break
/// rule (worker ids need not be contiguous).
pub fn partition_layer(
    layer: &LayerConfig,
    quant: &QuantParams,
    activation: &FeatureMap,
    workers: &[Arc<WorkerHandle>],
) -> Vec<WorkerTask> {
    match layer.layer_type {
        LayerType::Conv | LayerType::Depthwise | LayerType::Pointwise => {
            partition_conv(layer, quant, activation, workers)
        }
        LayerType::Fc => partition_fc(layer, quant, activation, workers),
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

fn partition_conv(
    layer: &LayerConfig,
    quant: &QuantParams,
    activation: &FeatureMap,
    workers: &[Arc<WorkerHandle>],
) -> Vec<WorkerTask> {
    let (c, h, w, data) = match activation {
        FeatureMap::Chw { c, h, w, data } => (*c, *h, *w, data),
        FeatureMap::Flat { .. } => {
            panic!("partition_conv called with a 1D activation; GAP should run before FC only")
        }
    };

    let kernel_size = layer.kernel_size as usize;
    let stride = layer.stride as usize;
    let padding = layer.padding as usize;

    let padded_h = h + 2 * padding;
    let padded_w = w + 2 * padding;
    let h_out = (padded_h - kernel_size) / stride + 1;
    let w_out = (padded_w - kernel_size) / stride + 1;

    let padded = pad_chw(c, h, w, data, padding, quant.z_in);

    if workers.is_empty() {
        return Vec::new();
    }
    let rows_per_worker = ceil_div(h_out, workers.len());

    let mut tasks = Vec::new();
    for (i, worker) in workers.iter().enumerate() {
        let r0 = i * rows_per_worker;
        let r1 = (r0 + rows_per_worker).min(h_out);
        if r0 >= r1 {
            continue;
        }

        let in_r0 = r0 * stride;
        let in_r1 = (r1 - 1) * stride + kernel_size;
        let patch = slice_chw_rows(c, padded_w, &padded, in_r0, in_r1);

        let message = TaskPayload {
            layer_type: layer.layer_type,
            layer_idx: layer.layer_idx,
            in_channels: layer.in_channels,
            in_h: (in_r1 - in_r0) as u32,
            in_w: padded_w as u32,
            out_channels: layer.out_channels,
            out_h: (r1 - r0) as u32,
            out_w: w_out as u32,
            kernel_size: layer.kernel_size,
            stride: layer.stride,
            padding: layer.padding,
            groups: layer.groups,
            in_features: 0,
            out_features: 0,
            input: patch,
        };

        tasks.push(WorkerTask {
            worker: worker.clone(),
            slice: SliceDescriptor::Rows { r0, r1 },
            message,
        });
    }
    tasks
}

fn partition_fc(
    layer: &LayerConfig,
    _quant: &QuantParams,
    activation: &FeatureMap,
    workers: &[Arc<WorkerHandle>],
) -> Vec<WorkerTask> {
    let data = match activation {
        FeatureMap::Flat { data } => data,
        FeatureMap::Chw { .. } => {
            panic!("partition_fc requires the caller to apply GAP before partitioning")
        }
    };

    if workers.is_empty() {
        return Vec::new();
    }
    let out_channels = layer.out_channels as usize;
    let classes_per_worker = ceil_div(out_channels, workers.len());

    let mut tasks = Vec::new();
    for (i, worker) in workers.iter().enumerate() {
        let c0 = i * classes_per_worker;
        let c1 = (c0 + classes_per_worker).min(out_channels);
        if c0 >= c1 {
            continue;
        }

        let message = TaskPayload {
            layer_type: LayerType::Fc,
            layer_idx: layer.layer_idx,
            in_channels: layer.in_channels,
            in_h: 0,
            in_w: 0,
            out_channels: layer.out_channels,
            out_h: 0,
            out_w: 0,
            kernel_size: 0,
            stride: 0,
            padding: 0,
            groups: layer.groups,
            in_features: layer.in_channels,
            out_features: (c1 - c0) as u32,
            input: data.clone(),
        };

        tasks.push(WorkerTask {
            worker: worker.clone(),
            slice: SliceDescriptor::Classes { c0, c1 },
            message,
        });
    }
    tasks
}

/// Symmetric zero-point padding on H and W, keeping channel as the
/// outermost (slowest-varying) axis.
fn pad_chw(c: usize, h: usize, w: usize, data: &[u8], padding: usize, z_in: u8) -> Vec<u8> {
    if padding == 0 {
        return data.to_vec();
    }
    let padded_h = h + 2 * padding;
    let padded_w = w + 2 * padding;
    let mut out = vec![z_in; c * padded_h * padded_w];
    for ch in 0..c {
        for row in 0..h {
            let src_off = (ch * h + row) * w;
            let dst_off = (ch * padded_h + (row + padding)) * padded_w + padding;
            out[dst_off..dst_off + w].copy_from_slice(&data[src_off..src_off + w]);
        }
    }
    out
}

/// Extract rows `[r0, r1)` across all channels from a padded `(C, H, W)`
/// buffer, preserving canonical `(C, h, W)` contiguous order.
fn slice_chw_rows(c: usize, padded_w: usize, padded: &[u8], r0: usize, r1: usize) -> Vec<u8> {
    let slice_h = r1 - r0;
    let mut out = Vec::with_capacity(c * slice_h * padded_w);
    let padded_h = padded.len() / (c * padded_w);
    for ch in 0..c {
        let base = ch * padded_h * padded_w;
        let start = base + r0 * padded_w;
        let end = base + r1 * padded_w;
        out.extend_from_slice(&padded[start..end]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_workers(n: usize) -> Vec<Arc<WorkerHandle>> {
        let mut out = Vec::new();
        for i in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
            let (server_side, _) = listener.accept().await.unwrap();
            let _client_side = connect.await.unwrap();
            let (reader, writer) = server_side.into_split();
            out.push(Arc::new(crate::registry::WorkerHandle::for_test(
                i as u8, reader, writer,
            )));
        }
        out
    }

    fn conv_layer() -> LayerConfig {
        LayerConfig {
            name: "conv1".into(),
            layer_type: LayerType::Conv,
            layer_idx: 0,
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            stride: 1,
            padding: 1,
            groups: 1,
            residual_add_to: None,
            residual_connect_from: None,
        }
    }

    fn quant() -> QuantParams {
        QuantParams {
            s_in: 1.0,
            z_in: 0,
            s_w: vec![1.0],
            z_w: vec![0],
            m: vec![1.0],
            s_out: 1.0,
            z_out: 0,
            s_residual_out: None,
            z_residual_out: None,
        }
    }

    #[tokio::test]
    async fn conv_partition_covers_all_output_rows_with_no_overlap() {
        let layer = conv_layer();
        let q = quant();
        let activation = FeatureMap::Chw {
            c: 1,
            h: 8,
            w: 8,
            data: vec![5u8; 64],
        };
        let workers = make_workers(3).await;

        let tasks = partition_layer(&layer, &q, &activation, &workers);
        assert_eq!(tasks.len(), 3);
        let mut covered = Vec::new();
        for t in &tasks {
            if let SliceDescriptor::Rows { r0, r1 } = t.slice {
                covered.push((r0, r1));
            } else {
                panic!("expected row slice");
            }
        }
        covered.sort();
        assert_eq!(covered, vec![(0, 3), (3, 6), (6, 8)]);
    }

    #[tokio::test]
    async fn fc_partition_last_worker_gets_remainder() {
        let mut layer = conv_layer();
        layer.layer_type = LayerType::Fc;
        layer.in_channels = 4;
        layer.out_channels = 10;
        let q = quant();
        let activation = FeatureMap::Flat {
            data: vec![1, 2, 3, 4],
        };
        let workers = make_workers(3).await;

        let tasks = partition_layer(&layer, &q, &activation, &workers);
        let mut covered = Vec::new();
        for t in &tasks {
            if let SliceDescriptor::Classes { c0, c1 } = t.slice {
                covered.push((c0, c1));
            } else {
                panic!("expected class slice");
            }
        }
        covered.sort();
        assert_eq!(covered, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[tokio::test]
    async fn conv_padding_uses_input_zero_point() {
        let mut layer = conv_layer();
        layer.padding = 1;
        let mut q = quant();
        q.z_in = 7;
        let activation = FeatureMap::Chw {
            c: 1,
            h: 2,
            w: 2,
            data: vec![1, 2, 3, 4],
        };
        let workers = make_workers(1).await;

        let tasks = partition_layer(&layer, &q, &activation, &workers);
        assert_eq!(tasks.len(), 1);
        // padded to 4x4, constant border should be the zero-point 7.
        assert_eq!(tasks[0].message.input[0], 7);
    }
}
