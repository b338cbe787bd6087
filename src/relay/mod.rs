mod heartbeat;
pub mod modbus;

pub use heartbeat::{HeartbeatSchedule, HeartbeatWrite};

use crate::config::{CameraTarget, RelayConfig, StatusTarget};
use crate::error::Result;
use crate::table::DetectionTable;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Granularity at which per-target heartbeat schedules are scanned
const HEARTBEAT_SCAN_INTERVAL: Duration = Duration::from_millis(200);

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Encode a set of marker IDs as a register bitmask: bit (ID-1) is set iff
/// the ID is present. IDs that do not fit the 16-bit register are ignored.
pub fn encode_mask(ids: &[u32]) -> u16 {
    let mut mask = 0u16;
    for &id in ids {
        if (1..=16).contains(&id) {
            mask |= 1 << (id - 1);
        }
    }
    mask
}

/// Destination for one camera's tag mask.
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub camera_index: usize,
    pub camera_name: String,
    pub host: String,
    pub register: u16,
}

impl RelayTarget {
    /// Collect the relay targets from the cameras that carry a protocol
    /// destination.
    pub fn from_cameras(cameras: &[CameraTarget]) -> Vec<Self> {
        cameras
            .iter()
            .filter_map(|camera| {
                camera.modbus.as_ref().map(|destination| Self {
                    camera_index: camera.index,
                    camera_name: camera.name.clone(),
                    host: destination.host.clone(),
                    register: destination.register,
                })
            })
            .collect()
    }
}

/// Bridges the synchronous camera workers to the asynchronous Modbus
/// client: a dedicated thread runs a current-thread tokio runtime hosting
/// two independently-scheduled periodic jobs, the tag relay and the
/// heartbeat.
pub struct ProtocolRelay {
    thread: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProtocolRelay {
    pub fn start(
        config: RelayConfig,
        targets: Vec<RelayTarget>,
        status_targets: Vec<StatusTarget>,
        table: Arc<DetectionTable>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let job_cancel = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("protocol-relay".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("failed to build relay runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(run_jobs(config, targets, status_targets, table, job_cancel));
            })?;

        info!("protocol relay started");
        Ok(Self {
            thread: Some(thread),
            cancel,
        })
    }

    /// Cancel both jobs and join the relay thread within a bounded timeout.
    pub fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.thread.take() {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("protocol relay thread panicked");
                } else {
                    info!("protocol relay stopped");
                }
            } else {
                warn!("protocol relay thread did not stop within timeout");
            }
        }
    }
}

impl Drop for ProtocolRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_jobs(
    config: RelayConfig,
    targets: Vec<RelayTarget>,
    status_targets: Vec<StatusTarget>,
    table: Arc<DetectionTable>,
    cancel: CancellationToken,
) {
    let transactions = Arc::new(AtomicU16::new(1));

    tokio::join!(
        tag_relay_job(&config, &targets, &table, &cancel, &transactions),
        heartbeat_job(&config, status_targets, &cancel, &transactions),
    );

    debug!("relay jobs finished");
}

/// Once per tick, write every camera's current mask to its destination.
/// The mask is written even when zero so downstream observes liveness.
async fn tag_relay_job(
    config: &RelayConfig,
    targets: &[RelayTarget],
    table: &DetectionTable,
    cancel: &CancellationToken,
    transactions: &AtomicU16,
) {
    if targets.is_empty() {
        debug!("no relay targets configured, tag relay idle");
        return;
    }

    let io_timeout = Duration::from_secs_f64(config.write_timeout_secs);
    let error_backoff = Duration::from_secs_f64(config.error_backoff_secs);
    let mut tick = tokio::time::interval(Duration::from_secs_f64(config.tick_secs));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let mut failures = 0usize;
        for target in targets {
            let ids = table.ids_for(target.camera_index);
            let mask = encode_mask(&ids);
            let txn = transactions.fetch_add(1, Ordering::Relaxed);

            match modbus::write_register(
                &target.host,
                config.port,
                config.unit_id,
                target.register,
                mask,
                txn,
                io_timeout,
            )
            .await
            {
                Ok(()) => {
                    info!(
                        "camera {}: wrote mask {:#018b} to {} register {}",
                        target.camera_name, mask, target.host, target.register
                    );
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "camera {}: register write to {} failed: {}",
                        target.camera_name, target.host, e
                    );
                }
            }
        }

        // Every destination down in the same tick reads as an outage; pause
        // before resuming the normal cadence.
        if failures == targets.len() {
            warn!(
                "all {} register writes failed, backing off {:.1}s",
                targets.len(),
                error_backoff.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(error_backoff) => {}
            }
            tick.reset();
        }
    }

    debug!("tag relay job stopped");
}

/// Drive the per-target heartbeat schedules, toggling 0/1 on each send.
async fn heartbeat_job(
    config: &RelayConfig,
    status_targets: Vec<StatusTarget>,
    cancel: &CancellationToken,
    transactions: &AtomicU16,
) {
    let mut schedule = HeartbeatSchedule::new(status_targets);
    if schedule.is_empty() {
        debug!("no status targets configured, heartbeat idle");
        return;
    }

    let io_timeout = Duration::from_secs_f64(config.write_timeout_secs);
    let error_backoff = Duration::from_secs_f64(config.error_backoff_secs);
    let mut scan = tokio::time::interval(HEARTBEAT_SCAN_INTERVAL);
    scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = scan.tick() => {}
        }

        let writes = schedule.due(Instant::now());
        let mut failed = false;
        for write in writes {
            let txn = transactions.fetch_add(1, Ordering::Relaxed);
            match modbus::write_register(
                &write.host,
                config.port,
                config.unit_id,
                write.register,
                write.value,
                txn,
                io_timeout,
            )
            .await
            {
                Ok(()) => {
                    info!(
                        "heartbeat {} written to {} register {}",
                        write.value, write.host, write.register
                    );
                }
                Err(e) => {
                    failed = true;
                    warn!(
                        "heartbeat write to {} register {} failed: {}",
                        write.host, write.register, e
                    );
                }
            }
        }

        if failed {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(error_backoff) => {}
            }
        }
    }

    debug!("heartbeat job stopped");
}
