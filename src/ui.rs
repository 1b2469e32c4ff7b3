use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

const SPINNER_TICK: Duration = Duration::from_millis(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: Option<&str>) -> Self {
        match flag.map(str::trim) {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            Some("auto") | None => UiMode::Auto,
            Some(other) => {
                log::warn!("unknown --ui mode '{}', using auto", other);
                UiMode::Auto
            }
        }
    }
}

/// Progress output on stderr. Pretty output needs a terminal; `auto` also falls back to
/// plain lines when stdout is redirected, so the JSON report stays clean.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: Option<&str>, stderr_is_tty: bool, stdout_redirected: bool) -> Self {
        let pretty = stderr_is_tty
            && match UiMode::parse(ui_flag) {
                UiMode::Pretty => true,
                UiMode::Auto => !stdout_redirected,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    /// Announce a phase; its duration is printed when the guard drops.
    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = self.pretty.then(|| {
            let spinner = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg} {elapsed}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message(name.to_string());
            spinner.enable_steady_tick(SPINNER_TICK);
            spinner
        });
        if spinner.is_none() {
            eprintln!("==> {}", name);
        }
        StageGuard {
            name: name.to_string(),
            started: Instant::now(),
            spinner,
        }
    }

    /// One buffer-usage bar per region, or nothing in plain mode.
    #[allow(dead_code)]
    pub fn buffer_bars(&self, capacities: &[usize]) -> Option<BufferBars> {
        if !self.pretty {
            return None;
        }
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template("roi {prefix:>2} [{bar:30}] {pos:>5}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let bars = capacities
            .iter()
            .enumerate()
            .map(|(idx, capacity)| {
                let bar = multi.add(ProgressBar::new(*capacity as u64));
                bar.set_style(style.clone());
                bar.set_prefix(idx.to_string());
                bar
            })
            .collect();
        Some(BufferBars { _multi: multi, bars })
    }
}

pub struct StageGuard {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let line = format!("✔ {} ({})", self.name, human_elapsed(self.started.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(line),
            None => eprintln!("{}", line),
        }
    }
}

/// Live view of each region's buffer fill level.
#[allow(dead_code)]
pub struct BufferBars {
    _multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl roi_recorder::ProgressSink for BufferBars {
    fn buffer_usage(&self, region: usize, buffered: usize, _capacity: usize) {
        if let Some(bar) = self.bars.get(region) {
            bar.set_position(buffered as u64);
        }
    }

    fn frames_captured(&self, count: u64) {
        if let Some(bar) = self.bars.first() {
            bar.set_message(format!("{count} frames"));
        }
    }

    fn finish(&self) {
        for bar in &self.bars {
            bar.finish_and_clear();
        }
    }
}

fn human_elapsed(elapsed: Duration) -> String {
    match elapsed.as_millis() {
        ms if ms < 1_000 => format!("{}ms", ms),
        _ => format!("{:.2}s", elapsed.as_secs_f64()),
    }
}
