//! Progress bars, notices and listings for the CLI.

use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::format::{format_bytes, format_duration, format_progress};
use crate::model::{Item, ItemId, ItemState, Notice, Snapshot};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";
const BAR_SCALE: u64 = 1000;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {percent:>3}% - {msg}")
        .expect("progress template is valid")
        .progress_chars("━━╌")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {prefix} - {msg}")
        .expect("spinner template is valid")
}

/// One progress bar per item, redrawn from snapshots.
pub struct ProgressView {
    progress: MultiProgress,
    bars: HashMap<ItemId, ProgressBar>,
}

impl ProgressView {
    pub fn new() -> Self {
        Self {
            progress: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, item: &Item) -> &ProgressBar {
        self.bars.entry(item.id.clone()).or_insert_with(|| {
            let bar = self.progress.add(ProgressBar::new(BAR_SCALE));
            bar.set_style(bar_style());
            bar.enable_steady_tick(Duration::from_millis(250));
            bar
        })
    }

    /// Brings every bar in line with `snapshot`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn update(&mut self, snapshot: &Snapshot) {
        for item in &snapshot.items {
            let tracked = self.bars.contains_key(&item.id);
            if !tracked && item.state != ItemState::InProgress {
                continue;
            }
            let bar = self.bar(item);
            if bar.is_finished() {
                continue;
            }
            match item.state {
                ItemState::InProgress if item.indeterminate => {
                    bar.set_style(spinner_style());
                    bar.set_prefix(item.title.clone());
                    bar.set_message(format_bytes(item.bytes_written));
                }
                ItemState::InProgress => {
                    bar.set_style(bar_style());
                    bar.set_position((item.progress_fraction * BAR_SCALE as f64) as u64);
                    bar.set_message(item.title.clone());
                }
                ItemState::Completed => {
                    bar.set_style(bar_style());
                    bar.set_position(BAR_SCALE);
                    bar.finish_with_message(format!("{} {}", item.title, style("done").green()));
                }
                ItemState::Failed => {
                    bar.abandon_with_message(format!("{} {}", item.title, style("failed").red()));
                }
                ItemState::Idle => bar.finish_and_clear(),
            }
        }
    }

    /// Prints a notice above the bars.
    pub fn notice(&self, notice: &Notice) {
        let _ = self.progress.println(styled_notice(notice));
    }

    pub fn clear(&self) {
        self.progress.clear().ok();
    }
}

impl Default for ProgressView {
    fn default() -> Self {
        Self::new()
    }
}

fn styled_notice(notice: &Notice) -> String {
    let subject = notice
        .item()
        .map_or_else(String::new, |id| format!("[{id}] "));
    if notice.is_error() {
        format!("{} {subject}{}", style("error:").red().bold(), notice.message())
    } else {
        format!("{} {subject}{}", style("info:").green().bold(), notice.message())
    }
}

/// Prints a notice without any bars on screen.
pub fn print_notice(notice: &Notice) {
    eprintln!("{}", styled_notice(notice));
}

fn state_label(item: &Item) -> String {
    match item.state {
        ItemState::Idle => style("idle").dim().to_string(),
        ItemState::InProgress => style(format_progress(item)).cyan().to_string(),
        ItemState::Completed => style("downloaded").green().to_string(),
        ItemState::Failed => style("failed").red().to_string(),
    }
}

/// Prints the registered items.
pub fn print_items(snapshot: &Snapshot) {
    if snapshot.items.is_empty() {
        println!("No videos registered.");
        return;
    }

    println!("\n{SEPARATOR}");
    println!("Videos:");
    println!("{SEPARATOR}");
    for item in &snapshot.items {
        println!(
            "  {:>3}  {:<12} {:<12} {}",
            item.id,
            item.title,
            state_label(item),
            item.source
        );
    }
    println!("{SEPARATOR}\n");
}

/// Prints a summary once every requested download has settled.
pub fn print_summary(snapshot: &Snapshot, elapsed: Duration) {
    let count = |state| {
        snapshot
            .items
            .iter()
            .filter(|item| item.state == state)
            .count()
    };
    let completed = count(ItemState::Completed);
    let failed = count(ItemState::Failed);
    let pending = count(ItemState::InProgress);

    println!("\n{SEPARATOR}");
    println!("Download Summary");
    println!("{SEPARATOR}");
    println!("  Downloaded:        {completed}");
    if failed > 0 {
        println!("  Failed:            {}", style(failed).red());
    }
    if pending > 0 {
        println!("  Still running:     {pending}");
    }
    println!("  Total time:        {}", format_duration(elapsed));
    println!("{SEPARATOR}");
}
