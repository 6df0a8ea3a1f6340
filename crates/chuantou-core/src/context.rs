use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Process-wide task context. Long-running tasks are spawned on `tasks`
/// and watch a child of `token`; cancelling the root token shuts the whole
/// tree down.
#[derive(Debug, Default)]
pub struct AppContext {
	pub token: CancellationToken,
	pub tasks: TaskTracker,
}
