//! CLI / process configuration. A plain struct parsed by `clap`, with no
//! validation logic beyond what `clap` already enforces.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "coordinator", about = "Distributed quantized inference coordinator")]
pub struct CoordinatorConfig {
    /// Target worker count before inference begins.
    #[arg(long, env = "COORDINATOR_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Address to bind the listener on.
    #[arg(long, env = "COORDINATOR_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the listener on.
    #[arg(long, env = "COORDINATOR_PORT", default_value_t = 7878)]
    pub port: u16,

    /// Path to the model config JSON (§6.2 shape).
    #[arg(long, env = "COORDINATOR_CONFIG")]
    pub config: PathBuf,

    /// Path to a raw input tensor (.bin), already quantized to uint8.
    #[arg(long, env = "COORDINATOR_INPUT")]
    pub input: PathBuf,

    /// Input shape as "channels,height,width".
    #[arg(long, env = "COORDINATOR_INPUT_SHAPE", value_parser = parse_shape)]
    pub input_shape: (usize, usize, usize),

    /// How long to wait for `workers` to reach IDLE before giving up.
    #[arg(long, default_value_t = 120)]
    pub registration_deadline_secs: u64,

    /// Registration handshake read timeout, per spec.md §5.
    #[arg(long, default_value_t = 2)]
    pub registration_timeout_secs: u64,

    /// Per-task RESULT header timeout, per spec.md §5.
    #[arg(long, default_value_t = 60)]
    pub task_header_timeout_secs: u64,

    /// Per-task RESULT payload timeout, per spec.md §5.
    #[arg(long, default_value_t = 10)]
    pub task_payload_timeout_secs: u64,

    /// Heartbeat sweep period.
    #[arg(long, default_value_t = 5)]
    pub heartbeat_period_secs: u64,

    /// Idle worker liveness deadline before the heartbeat monitor evicts it.
    /// A floor, not the value actually used: `effective_heartbeat_liveness`
    /// widens it so a worker idling out a registration wait or a slower
    /// sibling's task deadline is never mistaken for a stale connection.
    #[arg(long, default_value_t = 15)]
    pub heartbeat_liveness_secs: u64,

    /// Directory for the log file.
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Verbose stderr logging (mirrors the file log's default filter).
    #[arg(short, long)]
    pub verbose: bool,
}

impl CoordinatorConfig {
    pub fn registration_deadline(&self) -> Duration {
        Duration::from_secs(self.registration_deadline_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn task_header_timeout(&self) -> Duration {
        Duration::from_secs(self.task_header_timeout_secs)
    }

    pub fn task_payload_timeout(&self) -> Duration {
        Duration::from_secs(self.task_payload_timeout_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn heartbeat_liveness(&self) -> Duration {
        Duration::from_secs(self.heartbeat_liveness_secs)
    }

    /// The liveness deadline actually passed to `heartbeat_monitor`.
    ///
    /// An IDLE worker's `last_seen` only moves on registration and on
    /// finishing a task, so a worker can legitimately sit IDLE for as long
    /// as `registration_deadline` (waiting for stragglers to join) or for
    /// as long as `task_header_timeout + task_payload_timeout` (waiting
    /// out a slower sibling's task in the same layer) without anything
    /// being wrong. Widening the configured `heartbeat_liveness_secs` to
    /// cover both keeps the sweep from evicting a healthy worker mid-wait.
    pub fn effective_heartbeat_liveness(&self) -> Duration {
        self.heartbeat_liveness()
            .max(self.registration_deadline())
            .max(self.task_header_timeout() + self.task_payload_timeout())
    }
}

fn parse_shape(s: &str) -> Result<(usize, usize, usize), String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected \"C,H,W\", got \"{s}\""));
    }
    let parse = |p: &str| p.trim().parse::<usize>().map_err(|e| e.to_string());
    Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
}
