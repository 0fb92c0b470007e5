use clap::Parser;
use clap::ValueEnum;
use std::path::PathBuf;
use stepwise_core::protocol::ApprovalPolicy;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Model the agent should use.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Maximum number of LLM calls for the turn.
    #[arg(long = "max-steps", value_name = "N")]
    pub max_steps: Option<usize>,

    /// When patches are escalated to the user.
    #[arg(long = "approval-policy", value_enum)]
    pub approval_policy: Option<ApprovalModeCliArg>,

    /// Tell the agent to use the specified directory as its working root.
    #[arg(long = "cd", short = 'C', value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// JSON file with scripted model responses. Falls back to
    /// $STEPWISE_LLM_FIXTURE.
    #[arg(long = "fixture", value_name = "FILE")]
    pub fixture: Option<PathBuf>,

    /// Print events as JSON lines instead of human readable text.
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,

    /// Specifies color settings for use in the output.
    #[arg(long = "color", value_enum, default_value_t = Color::Auto)]
    pub color: Color,

    /// The request for the agent. Use `-` to read it from stdin.
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ApprovalModeCliArg {
    /// Ask only for patches that delete files.
    Auto,

    /// Ask for every patch.
    AlwaysAsk,

    /// Never ask. Protected paths are still refused.
    AlwaysApprove,
}

impl From<ApprovalModeCliArg> for ApprovalPolicy {
    fn from(value: ApprovalModeCliArg) -> Self {
        match value {
            ApprovalModeCliArg::Auto => ApprovalPolicy::Auto,
            ApprovalModeCliArg::AlwaysAsk => ApprovalPolicy::AlwaysAsk,
            ApprovalModeCliArg::AlwaysApprove => ApprovalPolicy::AlwaysApprove,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Color {
    Always,
    Never,
    #[default]
    Auto,
}
