use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{prefix:>8} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{prefix:>8} {spinner} {bytes} ({bytes_per_sec})";

pub trait ProgressSink: Send + Sync {
    fn add(&self, bytes: u64);
    fn finish(&self);
}

pub trait ProgressReporter: Send + Sync {
    fn sink(&self, label: String, len: Option<u64>) -> Box<dyn ProgressSink>;
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn add(&self, _bytes: u64) {}
    fn finish(&self) {}
}

pub struct Silent;

impl ProgressReporter for Silent {
    fn sink(&self, _label: String, _len: Option<u64>) -> Box<dyn ProgressSink> {
        Box::new(NoopSink)
    }
}

pub struct ChunkBars {
    multi: MultiProgress,
}

impl ChunkBars {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
        }
    }
}

impl Default for ChunkBars {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ChunkBars {
    fn sink(&self, label: String, len: Option<u64>) -> Box<dyn ProgressSink> {
        let bar = match len {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::with_template(BAR_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template(SPINNER_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        bar.set_prefix(label);
        Box::new(BarSink(self.multi.add(bar)))
    }
}

struct BarSink(ProgressBar);

impl ProgressSink for BarSink {
    fn add(&self, bytes: u64) {
        self.0.inc(bytes);
    }

    fn finish(&self) {
        self.0.finish();
    }
}
