use crate::Cancelled;
use tokio::task::JoinError;

/// Run a blocking task to completion. If the task is cancelled, the function
/// will return an error converted from `Error`.
///
/// Any panic that occurs in the blocking task will be propagated.
pub async fn run_blocking_task<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<Cancelled> + Send + 'static,
{
    match tokio::task::spawn_blocking(f)
        .await
        .map_err(JoinError::try_into_panic)
    {
        Ok(result) => result,
        Err(Err(_err)) => Err(E::from(Cancelled)),
        Err(Ok(payload)) => std::panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod test {
    use super::run_blocking_task;
    use crate::Cancelled;

    #[derive(Debug, PartialEq, Eq)]
    struct TestError;

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError
        }
    }

    #[tokio::test]
    async fn propagates_ok_result() {
        let result: Result<i32, TestError> = run_blocking_task(|| Ok(42)).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn propagates_err_result() {
        let result: Result<i32, TestError> = run_blocking_task(|| Err(TestError)).await;
        assert_eq!(result, Err(TestError));
    }
}
