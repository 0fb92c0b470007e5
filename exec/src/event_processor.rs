use stepwise_core::config::Config;
use stepwise_core::protocol::Event;
use stepwise_core::protocol::FileChange;

pub(crate) trait EventProcessor: Send {
    /// Print summary of effective configuration and user prompt.
    fn print_config_summary(&mut self, config: &Config, prompt: &str);

    /// Handle a single event emitted by the agent.
    fn process_event(&mut self, event: Event);
}

pub(crate) fn create_config_summary_entries(config: &Config) -> Vec<(&'static str, String)> {
    vec![
        ("workdir", config.cwd.display().to_string()),
        ("model", config.model.clone()),
        ("approval", config.approval_policy.to_string()),
        ("sandbox", config.sandbox_policy.to_string()),
        ("max steps", config.max_steps.to_string()),
    ]
}

pub(crate) fn format_file_change(change: &FileChange) -> &'static str {
    match change {
        FileChange::Add { .. } => "A",
        FileChange::Delete => "D",
        FileChange::Update {
            move_path: Some(_), ..
        } => "R",
        FileChange::Update {
            move_path: None, ..
        } => "M",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn file_change_codes() {
        assert_eq!(format_file_change(&FileChange::Delete), "D");
        assert_eq!(
            format_file_change(&FileChange::Add {
                content: String::new()
            }),
            "A"
        );
        assert_eq!(
            format_file_change(&FileChange::Update {
                unified_diff: String::new(),
                move_path: Some(PathBuf::from("b.txt")),
            }),
            "R"
        );
        assert_eq!(
            format_file_change(&FileChange::Update {
                unified_diff: String::new(),
                move_path: None,
            }),
            "M"
        );
    }
}
