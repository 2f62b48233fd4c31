//! Aggregate progress tracking: owns every file bar, the global
//! transferred/speed/count summary, and the terminal repaint loop.

pub mod bar;
pub mod format;

pub use bar::{Bar, ProgressReader};

use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use format::{
    calculate_percent, humanize_bytes, string_width, truncate_description,
    truncate_with_ellipsis, ERASE_LINE, MOVE_TO_START, MOVE_UP,
};

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Repaint interval.
    pub throttle: Duration,
    /// Fixed terminal width; detected when unset.
    pub width: Option<usize>,
    /// Force plain (non-ANSI) output; detected from the tty when unset.
    pub plain: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(65),
            width: None,
            plain: None,
        }
    }
}

#[derive(Default)]
struct AggregateState {
    uploaded: usize,
    uploaded_bytes: i64,
    existing: usize,
    existing_bytes: i64,
    errors: usize,
    error_bytes: i64,
    total_average_rate: f64,
    total_transfers: usize,
    total_size: i64,
    max_description_length: usize,
    prev_lines: usize,
}

/// Stop handle returned by [`Aggregator::start_progress`].
pub struct ProgressHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ProgressHandle {
    /// Close the render loop, wait for it to exit and move past the
    /// progress block.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
        println!();
    }
}

/// Writer-shaped sink for log output. Each write is forwarded to the
/// render loop, which splices the message above the progress block.
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let message = String::from_utf8_lossy(buf).trim_end().to_string();
        if !message.is_empty() {
            let _ = self.tx.send(message);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub struct Aggregator {
    bars: Mutex<Vec<Arc<Bar>>>,
    state: Mutex<AggregateState>,
    config: ProgressConfig,
    plain: bool,
    log_tx: mpsc::UnboundedSender<String>,
    log_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Aggregator {
    pub fn new(config: ProgressConfig) -> Self {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let plain = config
            .plain
            .unwrap_or_else(|| !std::io::stdout().is_terminal());
        Self {
            bars: Mutex::new(Vec::new()),
            state: Mutex::new(AggregateState::default()),
            config,
            plain,
            log_tx,
            log_rx: Mutex::new(Some(log_rx)),
        }
    }

    pub fn add_bar(&self, bar: Arc<Bar>) {
        self.bars.lock().push(bar);
    }

    /// Account upcoming work so the global percentage is meaningful from
    /// the first tick.
    pub fn add_transfer(&self, total_files: usize, total_size: i64) {
        let mut state = self.state.lock();
        state.total_transfers += total_files;
        state.total_size += total_size;
    }

    /// Account a file that already exists remotely and will not transfer.
    pub fn add_existing(&self, size: i64) {
        let mut state = self.state.lock();
        state.existing += 1;
        state.existing_bytes += size;
    }

    /// Sink for routing log output through the repaint loop.
    pub fn log_writer(&self) -> LogWriter {
        LogWriter {
            tx: self.log_tx.clone(),
        }
    }

    pub fn existing_count(&self) -> usize {
        self.state.lock().existing
    }

    fn term_width(&self) -> usize {
        if let Some(w) = self.config.width {
            return w;
        }
        crossterm::terminal::size()
            .map(|(w, _)| w as usize)
            .unwrap_or(80)
    }

    /// Spawn the render loop. The returned handle stops it.
    pub fn start_progress(self: &Arc<Self>) -> ProgressHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut log_rx = self
            .log_rx
            .lock()
            .take()
            .expect("progress loop already started");

        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.throttle);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.render(None);
                    }
                    message = log_rx.recv() => {
                        if let Some(message) = message {
                            this.render(Some(message));
                        }
                    }
                    _ = &mut stop_rx => {
                        this.render(None);
                        return;
                    }
                }
            }
        });

        ProgressHandle {
            stop: stop_tx,
            task,
        }
    }

    /// Build the stats + bars block for the current state. Derived
    /// counters are recomputed from scratch on every call, so unchanged
    /// state renders to identical output.
    pub fn render_snapshot(&self) -> String {
        let width = self.term_width();
        let bars = self.bars.lock().clone();

        // pass 1: derived counters reset, widest active description wins
        {
            let mut state = self.state.lock();
            state.uploaded = 0;
            state.uploaded_bytes = 0;
            state.total_average_rate = 0.0;
            state.errors = 0;
            state.error_bytes = 0;

            state.max_description_length = bars
                .iter()
                .filter(|b| !b.is_completed())
                .map(|b| string_width(&b.original_description()))
                .max()
                .unwrap_or(0);
        }

        let max_len = self.state.lock().max_description_length;

        // pass 2: collect lines and accumulate
        let mut bar_lines: Vec<String> = Vec::new();
        for bar in &bars {
            if !bar.is_completed() {
                bar.describe(truncate_description(
                    &bar.original_description(),
                    max_len,
                    width,
                ));
            }

            let line = bar.render_line();

            if bar.is_error() {
                let mut state = self.state.lock();
                state.errors += 1;
                state.error_bytes += bar.max();
                continue;
            }

            {
                let mut state = self.state.lock();
                state.uploaded_bytes += bar.current_bytes();
            }

            if bar.is_completed() {
                self.state.lock().uploaded += 1;
                continue;
            }

            bar_lines.push(line);

            if !bar.is_finished() {
                self.state.lock().total_average_rate += bar.average_rate();
            }
        }

        let stats = self.stats_block();

        let mut block = String::new();
        block.push_str(&stats);
        for line in &bar_lines {
            block.push('\n');
            block.push_str(&truncate_with_ellipsis(line, width));
        }
        block
    }

    fn stats_block(&self) -> String {
        let state = self.state.lock();

        let done_bytes = state.uploaded_bytes + state.existing_bytes;
        let (done_h, done_suf) = humanize_bytes(done_bytes as f64);
        let (total_h, total_suf) = humanize_bytes(state.total_size as f64);
        let (rate_h, rate_suf) = humanize_bytes(state.total_average_rate);

        let mut out = format!(
            "Transferred: {}{}/{}{}, {}%, {}{}/s\n",
            done_h,
            done_suf,
            total_h,
            total_suf,
            calculate_percent(done_bytes, state.total_size),
            rate_h,
            rate_suf,
        );

        let done_count = state.uploaded + state.existing;
        out.push_str(&format!(
            "Transferred: {}/{}, {}%\n",
            done_count,
            state.total_transfers,
            calculate_percent(done_count as i64, state.total_transfers as i64),
        ));

        if state.errors > 0 {
            out.push_str(&format!("Errors: {}\n", state.errors));
        }

        out.push_str("Transferring:");
        out
    }

    /// Repaint: clear the previous block, splice an optional log message
    /// above it, then write the fresh block.
    fn render(&self, log_message: Option<String>) {
        let block = self.render_snapshot();
        let width = self.term_width();

        let mut buf = String::new();

        if self.plain {
            if let Some(message) = &log_message {
                buf.push_str(message);
                buf.push('\n');
            }
            buf.push_str(&block);
            buf.push('\n');
        } else {
            let prev_lines = self.state.lock().prev_lines;

            if log_message.is_some() {
                buf.push('\n');
                buf.push_str(MOVE_UP);
            }
            for _ in 0..prev_lines.saturating_sub(1) {
                buf.push_str(ERASE_LINE);
                buf.push_str(MOVE_UP);
            }
            buf.push_str(ERASE_LINE);
            buf.push_str(MOVE_TO_START);

            if let Some(message) = &log_message {
                buf.push_str(ERASE_LINE);
                buf.push_str(&truncate_with_ellipsis(message, width));
                buf.push('\n');
            }

            let lines: Vec<&str> = block.split('\n').collect();
            self.state.lock().prev_lines = lines.len();
            for (i, line) in lines.iter().enumerate() {
                buf.push_str(line);
                if i != lines.len() - 1 {
                    buf.push('\n');
                }
            }
        }

        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(buf.as_bytes());
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_aggregator() -> Arc<Aggregator> {
        Arc::new(Aggregator::new(ProgressConfig {
            throttle: Duration::from_millis(65),
            width: Some(120),
            plain: Some(true),
        }))
    }

    #[test]
    fn test_render_snapshot_is_idempotent() {
        let agg = test_aggregator();
        agg.add_transfer(2, 2000);

        agg.add_bar(Arc::new(Bar::new(1000, "alpha.bin")));
        agg.add_bar(Arc::new(Bar::new(1000, "beta.bin")));

        let first = agg.render_snapshot();
        let second = agg.render_snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn test_summary_counts_uploaded_and_existing() {
        let agg = test_aggregator();
        agg.add_transfer(3, 300);
        agg.add_existing(100);

        let done = Arc::new(Bar::new(100, "done.bin"));
        done.inc(100);
        done.close();
        agg.add_bar(done);

        let active = Arc::new(Bar::new(100, "active.bin"));
        active.inc(40);
        agg.add_bar(active.clone());

        let snapshot = agg.render_snapshot();
        // 100 (completed) + 40 (active) + 100 (existing) of 300 bytes
        assert!(snapshot.contains("Transferred: 240.0 B/300.0 B, 80%"));
        // 1 uploaded + 1 existing of 3 transfers
        assert!(snapshot.contains("Transferred: 2/3, 66%"));
        // only the active bar renders
        assert!(snapshot.contains("active.bin"));
        assert!(!snapshot.contains("done.bin"));
    }

    #[test]
    fn test_errored_bars_are_counted_not_rendered() {
        let agg = test_aggregator();
        agg.add_transfer(2, 200);

        let failed = Arc::new(Bar::new(100, "failed.bin"));
        failed.inc(30);
        failed.abort();
        agg.add_bar(failed);

        let active = Arc::new(Bar::new(100, "active.bin"));
        agg.add_bar(active);

        let snapshot = agg.render_snapshot();
        assert!(snapshot.contains("Errors: 1"));
        assert!(!snapshot.contains("failed.bin"));
    }

    #[test]
    fn test_descriptions_align_to_widest_active_bar() {
        let agg = test_aggregator();
        let short = Arc::new(Bar::new(100, "a.bin"));
        let long = Arc::new(Bar::new(100, "a-much-longer-name.bin"));
        agg.add_bar(short.clone());
        agg.add_bar(long.clone());

        agg.render_snapshot();

        let w_short = string_width(&short.description());
        let w_long = string_width(&long.description());
        assert_eq!(w_short, w_long);
    }

    #[test]
    fn test_zero_state_renders_zero_percent() {
        let agg = test_aggregator();
        let snapshot = agg.render_snapshot();
        assert!(snapshot.contains("Transferred:  0 B/ 0 B, 0%"));
        assert!(snapshot.contains("Transferred: 0/0, 0%"));
        assert!(snapshot.ends_with("Transferring:"));
    }
}
