use std::time::Duration;

pub const DEFAULT_LOADING_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_CONVERGENCE_DELAY: Duration = Duration::from_millis(500);
pub const UNKNOWN_CHANNEL_LABEL: &str = "Unknown Channel";

/// How the store reconciles local state after a mutation succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergencePolicy {
    /// Full refetch a fixed delay after the mutation was sent successfully.
    /// Needed for bots that never acknowledge bridge mutations.
    DelayedRefetch(Duration),
    /// Full refetch as soon as the remote acknowledges the mutation.
    OnAcknowledgement,
}

/// What `delete_post` does to local state once the operator confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Drop the post locally before the server answers.
    Optimistic,
    /// Leave the post in place until the next refetch.
    #[default]
    AwaitServer,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub loading_timeout: Duration,
    pub convergence: ConvergencePolicy,
    pub delete_policy: DeletePolicy,
    pub unknown_channel_label: String,
    /// Show failed actions through `HostPrompts::alert` as well as in state.
    pub alert_on_failure: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            loading_timeout: DEFAULT_LOADING_TIMEOUT,
            convergence: ConvergencePolicy::DelayedRefetch(DEFAULT_CONVERGENCE_DELAY),
            delete_policy: DeletePolicy::default(),
            unknown_channel_label: UNKNOWN_CHANNEL_LABEL.to_string(),
            alert_on_failure: false,
        }
    }
}
