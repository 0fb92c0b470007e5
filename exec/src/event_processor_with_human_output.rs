use owo_colors::OwoColorize;
use owo_colors::Style;
use stepwise_core::config::Config;
use stepwise_core::protocol::Event;
use stepwise_core::protocol::EventMsg;
use stepwise_core::protocol::FileChange;
use stepwise_core::protocol::PatchChange;

use crate::event_processor::EventProcessor;
use crate::event_processor::create_config_summary_entries;
use crate::event_processor::format_file_change;

/// Tool output beyond this many lines is elided.
const MAX_OUTPUT_LINES: usize = 20;

pub(crate) struct EventProcessorWithHumanOutput {
    bold: Style,
    dimmed: Style,
    agent: Style,
    cyan: Style,
    green: Style,
    red: Style,
}

impl EventProcessorWithHumanOutput {
    pub(crate) fn create_with_ansi(with_ansi: bool) -> Self {
        if with_ansi {
            Self {
                bold: Style::new().bold(),
                dimmed: Style::new().dimmed(),
                agent: Style::new().bold().magenta(),
                cyan: Style::new().cyan(),
                green: Style::new().green(),
                red: Style::new().red(),
            }
        } else {
            Self {
                bold: Style::new(),
                dimmed: Style::new(),
                agent: Style::new(),
                cyan: Style::new(),
                green: Style::new(),
                red: Style::new(),
            }
        }
    }

    fn print_changes(&self, changes: &[PatchChange]) {
        for PatchChange { path, change } in changes {
            let code = format_file_change(change);
            match change {
                FileChange::Update {
                    unified_diff,
                    move_path: Some(dest),
                } => {
                    println!(
                        "{} {} -> {}",
                        code.style(self.bold),
                        path.display(),
                        dest.display()
                    );
                    print_diff(unified_diff, self.green, self.red);
                }
                FileChange::Update {
                    unified_diff,
                    move_path: None,
                } => {
                    println!("{} {}", code.style(self.bold), path.display());
                    print_diff(unified_diff, self.green, self.red);
                }
                FileChange::Add { .. } | FileChange::Delete => {
                    println!("{} {}", code.style(self.bold), path.display());
                }
            }
        }
    }
}

fn print_diff(unified_diff: &str, added: Style, removed: Style) {
    for line in unified_diff.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            println!("{}", line.style(added));
        } else if line.starts_with('-') && !line.starts_with("---") {
            println!("{}", line.style(removed));
        } else {
            println!("{line}");
        }
    }
}

impl EventProcessor for EventProcessorWithHumanOutput {
    fn print_config_summary(&mut self, config: &Config, prompt: &str) {
        for (key, value) in create_config_summary_entries(config) {
            println!("{} {}", format!("{key}:").style(self.bold), value);
        }
        println!("--------");
        println!("{}\n{prompt}", "User instructions:".style(self.cyan));
    }

    fn process_event(&mut self, event: Event) {
        let Event { id: _, msg } = event;
        match msg {
            EventMsg::Error { message } => {
                let prefix = "ERROR:".style(self.red);
                println!("{prefix} {message}");
            }
            EventMsg::TurnStarted => {}
            EventMsg::AgentThinking { step } => {
                println!("{}", format!("[step {step}] thinking").style(self.dimmed));
            }
            EventMsg::AgentTextDelta { .. } => {
                // The complete text arrives with `agent_text_done`.
            }
            EventMsg::AgentTextDone { message, .. } => {
                println!("\n{}\n{message}", "agent".style(self.agent));
            }
            EventMsg::ToolPlanned { message, .. } => {
                println!("{}", message.style(self.cyan));
            }
            EventMsg::ToolStarted {
                tool_name, call_id, ..
            } => {
                println!(
                    "{} {}",
                    tool_name.style(self.agent),
                    format!("({call_id})").style(self.dimmed)
                );
            }
            EventMsg::ToolOutputDelta { message, .. } => {
                let total = message.lines().count();
                for line in message.lines().take(MAX_OUTPUT_LINES) {
                    println!("{}", line.style(self.dimmed));
                }
                if total > MAX_OUTPUT_LINES {
                    println!(
                        "{}",
                        format!("... {} lines omitted", total - MAX_OUTPUT_LINES).style(self.dimmed)
                    );
                }
            }
            EventMsg::ToolFinished {
                tool_name,
                success,
                message,
                ..
            } => {
                if success {
                    println!("{}", format!("{tool_name} succeeded").style(self.green));
                } else {
                    let detail = message.unwrap_or_default();
                    println!("{} {detail}", format!("{tool_name} failed:").style(self.red));
                }
            }
            EventMsg::PatchApprovalRequest {
                request_id,
                reason,
                changes,
                ..
            } => {
                println!(
                    "{} {}",
                    "approval requested:".style(self.agent),
                    reason
                );
                self.print_changes(&changes);
                println!("{}", format!("request id: {request_id}").style(self.dimmed));
            }
            EventMsg::PatchApprovalResult { approved, .. } => {
                if approved {
                    println!("{}", "patch approved".style(self.green));
                } else {
                    println!("{}", "patch denied".style(self.red));
                }
            }
            EventMsg::TurnFinished { step, message } => {
                if let Some(message) = message {
                    println!("{}", message.style(self.dimmed));
                }
                println!("{}", format!("turn finished after {step} step(s)").style(self.dimmed));
            }
        }
    }
}
