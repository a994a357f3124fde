// Shared helpers for asynchronous assertions in unit tests

use std::time::Duration;

/// Poll `condition` until it holds or two seconds pass.
pub(crate) async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Give delivery workers time to run, for asserting that nothing arrives.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
