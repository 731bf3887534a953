use tokio::sync::oneshot;

use crate::{CancellationToken, TaskError};

/// Handle to a task running on one of the worker pools.
pub struct BlockingTask<T> {
    token: CancellationToken,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> BlockingTask<T> {
    pub(crate) fn new(
        token: CancellationToken,
        rx: oneshot::Receiver<Result<T, TaskError>>,
    ) -> Self {
        Self { token, rx }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn join(self) -> Result<T, TaskError> {
        self.rx
            .await
            .expect("blocking task dropped without sending a result")
    }
}
