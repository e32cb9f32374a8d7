//! End-to-end dispatch tests.
//!
//! Drives the Dispatch Engine against simulated workers over real TCP
//! sockets (ephemeral `127.0.0.1:0` listeners, mirroring the rest of the
//! suite) standing in for the worker-side compute kernels, which are out
//! of scope here. Verifies the partition/stitch pipeline against the
//! worked scenarios in spec.md §8.

use coordinator::dispatch::{DispatchEngine, TaskTimeouts};
use coordinator::model::{LayerConfig, QuantParams};
use coordinator::partition::FeatureMap;
use coordinator::registry::WorkerRegistry;
use coordinator::stats::StatsCollector;
use coordinator_protocol::messages::{LayerType, ResultPayload, TaskPayload};
use coordinator_protocol::MessageType;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spins up `n` connected worker pairs, registers the server side with
/// `registry` as IDLE, and returns the client sides for the test to drive
/// as fake workers.
async fn connect_workers(registry: &WorkerRegistry, n: usize) -> Vec<TcpStream> {
    let mut clients = Vec::new();
    for _ in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_side, _) = listener.accept().await.unwrap();
        let client_side = connect.await.unwrap();

        let handle = registry.add(server_side).await;
        registry.mark_idle(handle.id()).await;
        clients.push(client_side);
    }
    clients
}

async fn read_frame(stream: &mut TcpStream) -> (coordinator_protocol::Header, Vec<u8>) {
    let mut header_buf = [0u8; coordinator_protocol::HEADER_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = coordinator_protocol::decode_header(&header_buf).unwrap();
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (header, payload)
}

async fn write_frame(stream: &mut TcpStream, msg_type: MessageType, worker_id: u8, payload: &[u8]) {
    let header = coordinator_protocol::encode_header(msg_type, worker_id, payload.len() as u32);
    stream.write_all(&header).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

fn conv_layer() -> (LayerConfig, QuantParams) {
    let layer = LayerConfig {
        name: "conv1".into(),
        layer_type: LayerType::Conv,
        layer_idx: 0,
        in_channels: 3,
        out_channels: 8,
        kernel_size: 3,
        stride: 1,
        padding: 1,
        groups: 1,
        residual_add_to: None,
        residual_connect_from: None,
    };
    let quant = QuantParams {
        s_in: 1.0,
        z_in: 0,
        s_w: vec![1.0; 8],
        z_w: vec![0; 8],
        m: vec![1.0; 8],
        s_out: 1.0,
        z_out: 0,
        s_residual_out: None,
        z_residual_out: None,
    };
    (layer, quant)
}

/// Scenario 1 from spec.md §8: two workers, single CONV, input `(3,4,4)`,
/// `kernel=3,stride=1,padding=1,out_channels=8`. `H_out=4` splits into
/// rows `[0,2)` and `[2,4)`; each worker's constant output patch must
/// land at the matching output rows with no gap or overlap.
#[tokio::test]
async fn two_workers_single_conv_stitches_by_row_range() {
    let registry = Arc::new(WorkerRegistry::new());
    let mut clients = connect_workers(&registry, 2).await;

    let fake_worker = |mut stream: TcpStream, fill: u8| {
        tokio::spawn(async move {
            let (header, payload) = read_frame(&mut stream).await;
            assert_eq!(header.msg_type, MessageType::Task);
            let task = TaskPayload::decode(&payload).unwrap();
            let output = vec![fill; (task.out_h * task.out_w * task.out_channels) as usize];
            let result = ResultPayload {
                compute_time_us: 500,
                output,
            }
            .encode();
            write_frame(&mut stream, MessageType::Result, header.worker_id, &result).await;
        })
    };

    let w0 = clients.remove(0);
    let w1 = clients.remove(0);
    let t0 = fake_worker(w0, 11);
    let t1 = fake_worker(w1, 22);

    let (layer, quant) = conv_layer();
    let engine = DispatchEngine::new(
        registry.clone(),
        vec![layer],
        vec![quant],
        TaskTimeouts::default(),
    );

    let input = FeatureMap::Chw {
        c: 3,
        h: 4,
        w: 4,
        data: vec![0u8; 3 * 4 * 4],
    };
    let mut stats = StatsCollector::new();
    let output = engine.execute_inference(input, &mut stats).await.unwrap();

    t0.await.unwrap();
    t1.await.unwrap();

    match output {
        FeatureMap::Chw { c, h, w, data } => {
            assert_eq!((c, h, w), (8, 4, 4));
            for ch in 0..8 {
                let row_at = |r: usize| data[(ch * h + r) * w..(ch * h + r) * w + w].to_vec();
                assert_eq!(row_at(0), vec![11; 4]);
                assert_eq!(row_at(1), vec![11; 4]);
                assert_eq!(row_at(2), vec![22; 4]);
                assert_eq!(row_at(3), vec![22; 4]);
            }
        }
        _ => panic!("expected chw output"),
    }

    let recorded = stats.into_vec();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].workers.len(), 2);
}

/// Scenario 5 from spec.md §8: a worker that never answers a TASK aborts
/// the inference and the other worker still receives its slice.
#[tokio::test]
async fn unresponsive_worker_aborts_inference() {
    let registry = Arc::new(WorkerRegistry::new());
    let mut clients = connect_workers(&registry, 2).await;

    let w0 = clients.remove(0);
    let _w1_silent = clients.remove(0); // never answers

    let t0 = tokio::spawn(async move {
        let mut stream = w0;
        let (header, payload) = read_frame(&mut stream).await;
        let task = TaskPayload::decode(&payload).unwrap();
        let output = vec![1u8; (task.out_h * task.out_w * task.out_channels) as usize];
        let result = ResultPayload {
            compute_time_us: 100,
            output,
        }
        .encode();
        write_frame(&mut stream, MessageType::Result, header.worker_id, &result).await;
    });

    let (layer, quant) = conv_layer();
    let mut timeouts = TaskTimeouts::default();
    timeouts.header = std::time::Duration::from_millis(100);
    timeouts.payload = std::time::Duration::from_millis(100);
    let engine = DispatchEngine::new(registry.clone(), vec![layer], vec![quant], timeouts);

    let input = FeatureMap::Chw {
        c: 3,
        h: 4,
        w: 4,
        data: vec![0u8; 3 * 4 * 4],
    };
    let mut stats = StatsCollector::new();
    let result = engine.execute_inference(input, &mut stats).await;
    t0.await.unwrap();

    assert!(matches!(
        result,
        Err(coordinator::error::CoordinatorError::InferenceAborted { layer_idx: 0, .. })
    ));

    // The silent worker (id 1) is disconnected and removed rather than left
    // stuck BUSY forever; the worker that did answer (id 0) is untouched.
    let remaining = registry.snapshot_workers().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), 0);
}
