use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Terminal reporting for the batch CLI.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty)
    }

    fn use_pretty(&self) -> bool {
        match self.mode {
            UiMode::Pretty => true,
            UiMode::Auto => self.is_tty,
            UiMode::Plain => false,
        }
    }

    /// Percent-complete display for one job. Plain mode prints every tenth.
    pub fn job(&self, name: &str) -> JobProgress {
        let bar = if self.use_pretty() {
            let bar = ProgressBar::new(100);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template(
                "{spinner} {msg} [{bar:40}] {pos:>3}% ({elapsed})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(120));
            bar.set_message(name.to_string());
            Some(bar)
        } else {
            eprintln!("==> {}", name);
            None
        };
        JobProgress {
            name: name.to_string(),
            start: Instant::now(),
            bar,
            last_percent: None,
        }
    }
}

pub struct JobProgress {
    name: String,
    start: Instant,
    bar: Option<ProgressBar>,
    last_percent: Option<u8>,
}

impl JobProgress {
    pub fn set(&mut self, percent: u8) {
        if self.last_percent == Some(percent) {
            return;
        }
        match &self.bar {
            Some(bar) => bar.set_position(percent as u64),
            None => {
                let bucket = percent / 10;
                if self.last_percent.map(|p| p / 10) != Some(bucket) {
                    eprintln!("    {}: {}%", self.name, percent);
                }
            }
        }
        self.last_percent = Some(percent);
    }

    pub fn finish(self, summary: &str) {
        let message = format!(
            "✔ {} ({}) {}",
            self.name,
            format_duration(self.start.elapsed()),
            summary
        );
        match &self.bar {
            Some(bar) => {
                bar.set_position(100);
                bar.finish_with_message(message);
            }
            None => eprintln!("{message}"),
        }
    }

    pub fn abandon(self, reason: &str) {
        let message = format!("✘ {}: {}", self.name, reason);
        match &self.bar {
            Some(bar) => bar.abandon_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
