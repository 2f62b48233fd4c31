//! Per-file progress bar with an independent rolling rate estimator.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

use super::format::{calculate_eta, calculate_percent, format_duration, humanize_bytes};

const RATE_WINDOW: usize = 10;
const RATE_SAMPLE_SECS: f64 = 0.5;
const BAR_WIDTH: usize = 30;

struct BarState {
    max: i64,
    current: i64,
    current_bytes: i64,
    current_percent: i64,

    start_time: Instant,
    last_shown: Instant,

    counter_time: Instant,
    counter_since_last: i64,
    rates: VecDeque<f64>,
    average_rate: f64,

    description: String,
    original_description: String,

    completed: bool,
    finished: bool,
    error: bool,
}

/// Thread-safe progress state for one file job. Mutated by part tasks via
/// the reporter callback, read by the aggregator during renders.
pub struct Bar {
    state: Mutex<BarState>,
}

impl Bar {
    pub fn new(max: i64, description: &str) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BarState {
                max,
                current: 0,
                current_bytes: 0,
                current_percent: 0,
                start_time: now,
                last_shown: now,
                counter_time: now,
                counter_since_last: 0,
                rates: VecDeque::with_capacity(RATE_WINDOW),
                average_rate: 0.0,
                description: description.to_string(),
                original_description: description.to_string(),
                completed: false,
                finished: false,
                error: false,
            }),
        }
    }

    /// Advance the bar. Negative amounts roll back progress reported by a
    /// failed attempt; the running total never leaves `[0, max]`.
    pub fn inc(&self, n: i64) {
        let mut s = self.state.lock();
        if s.error {
            return;
        }

        s.current = (s.current + n).clamp(0, s.max);
        s.current_bytes = (s.current_bytes + n).clamp(0, s.max);

        s.counter_since_last += n;
        let since = s.counter_time.elapsed().as_secs_f64();
        if since > RATE_SAMPLE_SECS {
            let sample = s.counter_since_last as f64 / since;
            if s.rates.len() == RATE_WINDOW {
                s.rates.pop_front();
            }
            s.rates.push_back(sample);
            s.counter_time = Instant::now();
            s.counter_since_last = 0;
        }

        s.current_percent = calculate_percent(s.current, s.max);
    }

    /// Mark the bar aborted. One-way; the bar stops accepting increments
    /// and is counted as an error by the aggregator.
    pub fn abort(&self) {
        self.state.lock().error = true;
    }

    /// Mark the bar completed. One-way; completed bars leave the active
    /// display and are counted as uploaded.
    pub fn close(&self) {
        self.state.lock().completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_error(&self) -> bool {
        self.state.lock().error
    }

    pub fn max(&self) -> i64 {
        self.state.lock().max
    }

    pub fn current_bytes(&self) -> i64 {
        self.state.lock().current_bytes
    }

    pub fn original_description(&self) -> String {
        self.state.lock().original_description.clone()
    }

    pub fn description(&self) -> String {
        self.state.lock().description.clone()
    }

    /// Replace the visible (possibly truncated) description.
    pub fn describe(&self, description: String) {
        self.state.lock().description = description;
    }

    /// Mean of the rolling window; falls back to the whole-transfer
    /// average once finished or before the first sample lands.
    pub fn average_rate(&self) -> f64 {
        self.state.lock().average_rate
    }

    /// Render the bar's line and refresh derived state (`finished`,
    /// `average_rate`, `last_shown`).
    pub fn render_line(&self) -> String {
        let mut s = self.state.lock();

        if !s.finished && s.max > 0 && s.current >= s.max {
            s.finished = true;
        }

        let mut average = if s.rates.is_empty() {
            0.0
        } else {
            s.rates.iter().sum::<f64>() / s.rates.len() as f64
        };
        if s.rates.is_empty() || s.finished {
            let elapsed = s.start_time.elapsed().as_secs_f64();
            average = if elapsed > 0.0 {
                s.current_bytes as f64 / elapsed
            } else {
                0.0
            };
        }
        s.average_rate = average;
        s.last_shown = Instant::now();

        let filled = if s.max > 0 {
            (s.current_percent as usize * BAR_WIDTH) / 100
        } else {
            BAR_WIDTH
        };
        let filled = filled.min(BAR_WIDTH);
        let saucer = if filled == 0 {
            " ".repeat(BAR_WIDTH)
        } else if filled == BAR_WIDTH {
            "=".repeat(BAR_WIDTH)
        } else {
            format!("{}>{}", "=".repeat(filled - 1), " ".repeat(BAR_WIDTH - filled))
        };

        let (cur_h, cur_suf) = humanize_bytes(s.current_bytes as f64);
        let (max_h, max_suf) = humanize_bytes(s.max as f64);
        let counts = if cur_suf == max_suf {
            format!("{}/{}{}", cur_h, max_h, max_suf)
        } else {
            format!("{}{}/{}{}", cur_h, cur_suf, max_h, max_suf)
        };

        let (rate_h, rate_suf) = humanize_bytes(average);
        let elapsed = format_duration(s.start_time.elapsed());
        let eta = format_duration(calculate_eta(
            average,
            s.max as f64,
            s.current_bytes as f64,
        ));

        let tail = if s.finished { " | finishing" } else { "" };

        format!(
            "{} {:>3}% |{}| ({}, {}{}/s) [{}:{}]{}",
            s.description, s.current_percent, saucer, counts, rate_h, rate_suf, elapsed, eta, tail
        )
    }
}

/// Wrap a byte stream so every chunk that flows through reports its
/// length to the reporter before continuing downstream.
pub struct ProgressReader<R> {
    inner: R,
    reporter: Box<dyn Fn(i64) + Send + Sync>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, reporter: impl Fn(i64) + Send + Sync + 'static) -> Self {
        Self {
            inner,
            reporter: Box::new(reporter),
        }
    }
}

impl<R: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;
        let poll = std::pin::Pin::new(&mut me.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                (me.reporter)(n as i64);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_inc_clamps_to_max() {
        let bar = Bar::new(100, "test");
        bar.inc(50);
        assert_eq!(bar.current_bytes(), 50);
        bar.inc(500);
        assert_eq!(bar.current_bytes(), 100);
    }

    #[test]
    fn test_negative_inc_rolls_back() {
        let bar = Bar::new(100, "test");
        bar.inc(60);
        bar.inc(-20);
        assert_eq!(bar.current_bytes(), 40);
        bar.inc(-100);
        assert_eq!(bar.current_bytes(), 0);
    }

    #[test]
    fn test_render_marks_finished_at_max() {
        let bar = Bar::new(10, "test");
        bar.inc(10);
        assert!(!bar.is_finished());
        let line = bar.render_line();
        assert!(bar.is_finished());
        assert!(line.contains("100%"));
        assert!(line.contains("finishing"));
    }

    #[test]
    fn test_state_transitions_are_one_way() {
        let bar = Bar::new(10, "test");
        bar.abort();
        assert!(bar.is_error());
        bar.inc(5);
        assert_eq!(bar.current_bytes(), 0);

        let bar = Bar::new(10, "test");
        bar.close();
        assert!(bar.is_completed());
    }

    #[test]
    fn test_rate_window_is_bounded() {
        let bar = Bar::new(i64::MAX, "test");
        {
            let mut s = bar.state.lock();
            for i in 0..25 {
                if s.rates.len() == RATE_WINDOW {
                    s.rates.pop_front();
                }
                s.rates.push_back(i as f64);
            }
            assert_eq!(s.rates.len(), RATE_WINDOW);
            assert_eq!(s.rates.front().copied(), Some(15.0));
        }
    }

    #[test]
    fn test_average_rate_fallback_without_samples() {
        let bar = Bar::new(1_000_000, "test");
        bar.inc(1000);
        std::thread::sleep(std::time::Duration::from_millis(20));
        bar.render_line();
        // no window samples yet: whole-transfer average applies
        assert!(bar.average_rate() > 0.0);
    }

    #[tokio::test]
    async fn test_progress_reader_reports_all_bytes() {
        let data = vec![7u8; 4096];
        let seen = Arc::new(AtomicI64::new(0));
        let seen_inner = seen.clone();
        let mut reader = ProgressReader::new(&data[..], move |n| {
            seen_inner.fetch_add(n, Ordering::SeqCst);
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len(), 4096);
        assert_eq!(seen.load(Ordering::SeqCst), 4096);
    }
}
