//! Scheduled device sampling with optional linear interpolation onto an
//! exact time grid, bounded error tolerance and adaptive sleep.
//!
//! Grounded on `vzclient/asyncio/device_reader.py::DeviceReader`.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::driver::Sample;

/// Either an explicit device timestamp (epoch ms) or `None` meaning "stamp
/// with local time", paired with the sampled value.
pub type RawSample = (Option<i64>, f64);

const EXEC_WINDOW: usize = 10;

/// Scheduled sampler over an async primitive returning [`RawSample`] or an
/// error.
///
/// `sample_fn` is called once per scheduling round; its result becomes the
/// next `(t1, v1)` pair. Consecutive two-point windows are used to linearly
/// interpolate values onto exact multiples of `sampling_interval_ms` when
/// `interpolate` is set.
pub struct DeviceReader<F> {
    sample_fn: F,
    use_device_time: bool,
    interpolate: bool,
    sampling_interval_ms: i64,
    allowed_errors: i64,
    name: String,

    prev: Option<(i64, f64)>,
    last: Option<(i64, f64)>,
    exec_time: [f64; EXEC_WINDOW],
    exec_pos: usize,
    stopped: bool,
}

impl<F, Fut, E> DeviceReader<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RawSample, E>>,
    E: std::fmt::Display,
{
    pub fn new(
        sample_fn: F,
        use_device_time: bool,
        interpolate: bool,
        sampling_interval_ms: i64,
        allowed_errors: i64,
        name: impl Into<String>,
    ) -> Self {
        Self {
            sample_fn,
            use_device_time,
            interpolate,
            sampling_interval_ms,
            allowed_errors,
            name: name.into(),
            prev: None,
            last: None,
            exec_time: [0.0; EXEC_WINDOW],
            exec_pos: 0,
            stopped: false,
        }
    }

    /// Request that the reader stop at the next scheduling boundary.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn mean_exec_time(&self) -> f64 {
        self.exec_time.iter().sum::<f64>() / self.exec_time.len() as f64
    }

    fn record_exec_time(&mut self, sleep_s: f64) {
        let (Some((t0, _)), Some((t1, _))) = (self.prev, self.last) else {
            return;
        };
        self.exec_time[self.exec_pos] = (t1 - t0) as f64 / 1000.0 - sleep_s;
        self.exec_pos = (self.exec_pos + 1) % EXEC_WINDOW;
    }

    async fn update(&mut self) -> Result<bool, E> {
        debug!(device = %self.name, "reading from device");
        let (t, v) = match (self.sample_fn)().await {
            Ok(sample) => sample,
            Err(err) => {
                warn!(device = %self.name, %err, "sampling error");
                if self.allowed_errors == 0 {
                    return Err(err);
                }
                if self.allowed_errors > 0 {
                    self.allowed_errors -= 1;
                }
                return Ok(false);
            }
        };

        let t = if self.use_device_time {
            t.unwrap_or_else(now_ms)
        } else {
            now_ms()
        };

        self.prev = self.last;
        self.last = Some((t, v));
        Ok(true)
    }

    /// Interpolate (or fetch verbatim) the value at `t`, defaulting to the
    /// most recent sample when `t` is `None`.
    fn value_at(&self, t: Option<i64>) -> (i64, f64) {
        let (t1, v1) = self.last.expect("value_at called before any sample");
        let Some(t) = t else {
            return (t1, v1);
        };
        let (t0, v0) = self.prev.expect("interpolation requires two samples");
        if t < t0 {
            warn!(device = %self.name, ms = t0 - t, "extrapolating into the past");
        } else if t > t1 {
            warn!(device = %self.name, ms = t - t1, "extrapolating into the future");
        }
        let w = (t - t0) as f64 / (t1 - t0) as f64;
        (t, (1.0 - w) * v0 + w * v1)
    }

    /// Run the scheduled sampling loop, emitting each `(t, v)` via `emit`.
    /// Returns when `stop()` has been called or sampling is exhausted by
    /// `allowed_errors`.
    pub async fn run(mut self, mut emit: impl FnMut(Sample)) -> Result<(), E> {
        let mut sleep_s = self.sampling_interval_ms as f64 / 1000.0;

        // Prime phase: sample until the first success.
        let mut primed = false;
        while !self.stopped && !primed {
            primed = self.update().await?;
            if primed && !self.interpolate {
                let (t, v) = self.value_at(None);
                emit((t, v));
            }
            sleep(Duration::from_secs_f64(sleep_s.max(0.0))).await;
        }

        // Steady phase.
        while !self.stopped {
            if self.update().await? {
                self.record_exec_time(sleep_s);
                let mean = self.mean_exec_time();

                if self.interpolate {
                    let (t1, _) = self.last.unwrap();
                    let i = t1.div_euclid(self.sampling_interval_ms);
                    let grid_t = i * self.sampling_interval_ms;
                    emit(self.value_at(Some(grid_t)));

                    let dt_min = 0.05 * mean;
                    let next_grid = (i + 1) * self.sampling_interval_ms;
                    sleep_s = dt_min + (next_grid - t1) as f64 / 1000.0;
                } else {
                    sleep_s = self.sampling_interval_ms as f64 / 1000.0;
                    emit(self.value_at(None));
                }

                sleep_s -= mean;
                if sleep_s < 0.0 {
                    warn!(
                        device = %self.name,
                        mean_exec_ms = mean * 1000.0,
                        "mean execution time exceeds sampling interval, clamping sleep to 0"
                    );
                    sleep_s = 0.0;
                }
            }
            sleep(Duration::from_secs_f64(sleep_s.max(0.0))).await;
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn interpolated_timestamps_land_on_grid() {
        // spec.md §8 scenario 6: interval 500ms, interpolate on.
        let counter = Arc::new(AtomicI64::new(0));
        let c = counter.clone();
        let reader = DeviceReader::new(
            move || {
                let c = c.clone();
                async move {
                    let i = c.fetch_add(1, Ordering::SeqCst);
                    // Device time advances by 300ms per sample, off-grid.
                    Ok::<_, Infallible>((Some(i * 300), i as f64))
                }
            },
            true,
            true,
            500,
            -1,
            "test",
        );

        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let e = emitted.clone();
        let handle = tokio::spawn(async move {
            let mut reader = reader;
            let _ = reader
                .run(move |sample| e.lock().unwrap().push(sample))
                .await;
        });

        tokio::time::advance(Duration::from_secs(5)).await;
        handle.abort();
        let _ = handle.await;

        let values = emitted.lock().unwrap().clone();
        assert!(!values.is_empty());
        for &(t, _) in &values {
            assert_eq!(t % 500, 0);
        }
        for w in values.windows(2) {
            assert_eq!(w[1].0 - w[0].0, 500);
        }
    }

    #[test]
    fn mean_exec_time_starts_at_zero() {
        let reader = DeviceReader::new(
            || async { Ok::<_, Infallible>((None, 0.0)) },
            true,
            false,
            1000,
            -1,
            "test",
        );
        assert_eq!(reader.mean_exec_time(), 0.0);
    }
}
