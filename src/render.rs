//! Terminal rendering of conda progress messages.
//!
//! conda emits `{"fetch"|"name": .., "maxval": N, "progress": i}` per update
//! and a `finished` frame per phase; each phase gets its own bar.

use conda_stream::streaming::is_finished;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;

const TEMPLATE: &str = "{spinner:.green} {msg:24!} [{bar:40.cyan/blue}] {pos}/{len}";

#[derive(Default)]
pub struct ProgressRenderer {
    bar: Option<ProgressBar>,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, message: &Value) {
        let bar = self.bar.get_or_insert_with(new_bar);

        if let Some(max) = message.get("maxval").and_then(Value::as_u64) {
            bar.set_length(max);
        }
        if let Some(pos) = message.get("progress").and_then(Value::as_u64) {
            bar.set_position(pos);
        }
        if let Some(label) = message
            .get("fetch")
            .or_else(|| message.get("name"))
            .and_then(Value::as_str)
        {
            bar.set_message(label.to_string());
        }

        if is_finished(message) {
            if let Some(bar) = self.bar.take() {
                bar.finish();
            }
        }
    }
}

impl Drop for ProgressRenderer {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn new_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}
