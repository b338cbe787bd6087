use super::{FrameSource, SourceConnector};
use crate::error::{Result, TagRelayError};
use crate::frame::FrameData;
use image::RgbImage;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Consecutive-failure count is reported once every this many failures so a
/// dead endpoint does not flood the log.
const FAILURE_WARN_MODULUS: u64 = 10;

/// Smoothing factor for the response-time average
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Fetch-loop counters. Copied out under lock by [`SnapshotSource::stats`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_secs: f64,
}

/// Connector for the snapshot-poll variant: one blocking HTTP GET per
/// interval against a camera's snapshot endpoint.
pub struct SnapshotConnector {
    url: String,
    username: String,
    password: String,
    interval: Duration,
    timeout: Duration,
    name: String,
}

impl SnapshotConnector {
    pub fn new(
        url: String,
        username: String,
        password: String,
        interval: Duration,
        timeout: Duration,
        name: String,
    ) -> Self {
        Self {
            url,
            username,
            password,
            interval,
            timeout,
            name,
        }
    }
}

impl SourceConnector for SnapshotConnector {
    /// Probe the endpoint with a single fetch, then start the fetch thread.
    /// A failed probe keeps the camera in its Connecting state.
    fn connect(&self) -> Result<Box<dyn FrameSource>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("tagrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TagRelayError::capture(format!("http client init failed: {}", e)))?;

        let probe = fetch_snapshot(&client, &self.url, &self.username, &self.password)?;

        info!(
            "snapshot client started for {} (interval {:.2}s)",
            self.name,
            self.interval.as_secs_f64()
        );

        let source = SnapshotSource::start(
            client,
            self.url.clone(),
            self.username.clone(),
            self.password.clone(),
            self.interval,
            self.name.clone(),
            probe,
        )?;
        Ok(Box::new(source))
    }

    fn describe(&self) -> String {
        format!("snapshot {}", self.url)
    }
}

struct FrameCell {
    latest: Option<FrameData>,
    seq: u64,
}

struct FetchShared {
    cell: Mutex<FrameCell>,
    new_frame: Condvar,
    stats: Mutex<SnapshotStats>,
    running: AtomicBool,
}

/// Open snapshot source: a background fetch thread publishing into a
/// single-slot latest-frame cell; consumers copy the cell so a slow
/// consumer never stalls the fetch loop.
pub struct SnapshotSource {
    shared: Arc<FetchShared>,
    fetch_thread: Option<JoinHandle<()>>,
    last_seen_seq: u64,
    read_timeout: Duration,
    name: String,
}

impl SnapshotSource {
    #[allow(clippy::too_many_arguments)]
    fn start(
        client: reqwest::blocking::Client,
        url: String,
        username: String,
        password: String,
        interval: Duration,
        name: String,
        probe: RgbImage,
    ) -> Result<Self> {
        let shared = Arc::new(FetchShared {
            cell: Mutex::new(FrameCell {
                latest: Some(FrameData::new(0, SystemTime::now(), probe)),
                seq: 1,
            }),
            new_frame: Condvar::new(),
            stats: Mutex::new(SnapshotStats {
                total_requests: 1,
                successful_requests: 1,
                ..SnapshotStats::default()
            }),
            running: AtomicBool::new(true),
        });

        let fetch_shared = Arc::clone(&shared);
        let fetch_name = name.clone();
        let fetch_thread = std::thread::Builder::new()
            .name(format!("snapshot-{}", name))
            .spawn(move || {
                fetch_loop(
                    fetch_shared,
                    client,
                    url,
                    username,
                    password,
                    interval,
                    fetch_name,
                )
            })?;

        // A stalled poller must bounce the worker back to Connecting rather
        // than block it forever.
        let read_timeout = interval * 3 + Duration::from_secs(5);

        Ok(Self {
            shared,
            fetch_thread: Some(fetch_thread),
            last_seen_seq: 0,
            read_timeout,
            name,
        })
    }

    /// Copy of the fetch-loop counters.
    pub fn stats(&self) -> SnapshotStats {
        self.shared.stats.lock().clone()
    }
}

impl FrameSource for SnapshotSource {
    fn read_frame(&mut self) -> Result<FrameData> {
        let deadline = Instant::now() + self.read_timeout;
        let mut cell = self.shared.cell.lock();

        while cell.seq == self.last_seen_seq {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TagRelayError::capture(format!(
                    "{}: no new snapshot within {:.1}s",
                    self.name,
                    self.read_timeout.as_secs_f64()
                )));
            }
            self.shared.new_frame.wait_for(&mut cell, remaining);
        }

        self.last_seen_seq = cell.seq;
        cell.latest
            .clone()
            .ok_or_else(|| TagRelayError::capture(format!("{}: latest frame cell empty", self.name)))
    }
}

impl Drop for SnapshotSource {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.fetch_thread.take() {
            if handle.join().is_err() {
                warn!("snapshot fetch thread for {} panicked", self.name);
            }
        }
    }
}

fn fetch_loop(
    shared: Arc<FetchShared>,
    client: reqwest::blocking::Client,
    url: String,
    username: String,
    password: String,
    interval: Duration,
    name: String,
) {
    let mut next_deadline = Instant::now() + interval;
    let mut frame_counter: u64 = 1;
    let mut consecutive_failures: u64 = 0;

    loop {
        // Interval sleep comes first: the probe fetch already produced the
        // initial frame.
        if !sleep_until(&shared.running, next_deadline) {
            break;
        }

        let started = Instant::now();
        shared.stats.lock().total_requests += 1;

        match fetch_snapshot(&client, &url, &username, &password) {
            Ok(pixels) => {
                let frame = FrameData::new(frame_counter, SystemTime::now(), pixels);
                frame_counter += 1;
                consecutive_failures = 0;

                {
                    let mut cell = shared.cell.lock();
                    cell.latest = Some(frame);
                    cell.seq += 1;
                }
                shared.new_frame.notify_all();
                shared.stats.lock().successful_requests += 1;
            }
            Err(e) => {
                consecutive_failures += 1;
                shared.stats.lock().failed_requests += 1;
                if consecutive_failures % FAILURE_WARN_MODULUS == 0 {
                    warn!("{}: {} consecutive fetch failures", name, consecutive_failures);
                } else {
                    debug!("{}: snapshot fetch failed: {}", name, e);
                }
            }
        }

        {
            let mut stats = shared.stats.lock();
            stats.avg_response_secs =
                smooth_response_time(stats.avg_response_secs, started.elapsed().as_secs_f64());
        }

        let (deadline, lag) = advance_deadline(next_deadline, interval, Instant::now());
        if let Some(lag) = lag {
            debug!("{}: snapshot loop lagging by {:.3}s", name, lag.as_secs_f64());
        }
        next_deadline = deadline;
    }

    debug!("{}: snapshot fetch loop stopped", name);
}

/// Advance the absolute next-deadline accumulator by one interval.
///
/// When the loop has fallen behind the accumulated deadline, the deadline is
/// reset to `now` (returning the lag) instead of scheduling back-to-back
/// requests; otherwise the accumulator keeps absolute time so intermittent
/// slow responses cannot cause permanent drift.
fn advance_deadline(
    next_deadline: Instant,
    interval: Duration,
    now: Instant,
) -> (Instant, Option<Duration>) {
    let advanced = next_deadline + interval;
    if advanced <= now {
        (now, Some(now - advanced))
    } else {
        (advanced, None)
    }
}

fn smooth_response_time(avg: f64, sample: f64) -> f64 {
    avg * (1.0 - RESPONSE_TIME_ALPHA) + sample * RESPONSE_TIME_ALPHA
}

/// Sleep until `deadline` in bounded slices, returning false as soon as the
/// running flag clears.
fn sleep_until(running: &AtomicBool, deadline: Instant) -> bool {
    const SLICE: Duration = Duration::from_millis(200);

    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(SLICE));
    }
}

fn fetch_snapshot(
    client: &reqwest::blocking::Client,
    url: &str,
    username: &str,
    password: &str,
) -> Result<RgbImage> {
    let mut request = client.get(url);
    if !username.is_empty() {
        request = request.basic_auth(username, Some(password));
    }

    let response = request
        .send()
        .map_err(|e| TagRelayError::capture(format!("snapshot request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TagRelayError::capture(format!(
            "snapshot endpoint returned HTTP {}",
            status
        )));
    }

    let body = response
        .bytes()
        .map_err(|e| TagRelayError::capture(format!("snapshot body read failed: {}", e)))?;

    let image = image::load_from_memory(&body)
        .map_err(|e| TagRelayError::capture(format!("snapshot decode failed: {}", e)))?;

    Ok(image.to_rgb8())
}
