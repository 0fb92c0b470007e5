use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    pub STEPWISE_DEFAULT_MODEL: &str = "fixture";

    /// Timeout applied to `shell` tool calls that do not specify one.
    pub STEPWISE_EXEC_TIMEOUT_MS: Duration = Duration::from_millis(10_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Fixture path for offline runs (see fixture_client.rs).
    pub STEPWISE_LLM_FIXTURE: Option<&str> = None;
}
