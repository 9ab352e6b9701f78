//! Terminal output of the demo command: a spinner while the run is active and a
//! colored summary of its final state.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use flowrun::state::{State, StateType};

pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    /// Start the spinner for a run of `flow_name`.
    pub fn start(flow_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("starting flow '{flow_name}'"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    /// Note a failed attempt that may be retried.
    pub fn retry(&self, attempt: u32, max: u32, reason: &str) {
        self.pb.println(format!(
            "  {} attempt {attempt} failed ({max} retries allowed): {reason}",
            self.yellow.apply_to("↻")
        ));
    }

    /// Stop the spinner and print the final state.
    pub fn complete(&self, state: &State) {
        self.pb.finish_and_clear();
        let style = self.style_for(state.state_type());
        let mark = if state.is_completed() { "✓" } else { "✗" };
        println!("  {} {state}", style.apply_to(mark));
    }

    /// Stop the spinner after an error that left no final state.
    pub fn abandon(&self, reason: &str) {
        self.pb.finish_and_clear();
        println!("  {} {reason}", self.red.apply_to("✗"));
    }

    /// Print the final state as pretty JSON.
    pub fn print_state(&self, state: &State) {
        let style = self.style_for(state.state_type());
        println!();
        println!("{}", style.apply_to("─── Final State ───"));
        println!("{}", serde_json::to_string_pretty(state).unwrap_or_default());
    }

    fn style_for(&self, state_type: StateType) -> &Style {
        match state_type {
            StateType::Completed => &self.green,
            StateType::Failed | StateType::Crashed => &self.red,
            _ => &self.yellow,
        }
    }
}
