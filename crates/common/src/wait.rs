use std::time::Duration;

/// Poll `connect` until it succeeds, sleeping `poll_interval_ms` between attempts.
pub async fn wait_for_resource_async<F, Fut, T, E>(
    mut connect: F,
    poll_interval_ms: u64,
    resource_name: &str,
) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        match connect().await {
            Ok(resource) => {
                tracing::info!("{} connected", resource_name);
                return resource;
            }
            Err(e) => {
                tracing::debug!("Waiting for {} ({})", resource_name, e);
                tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
            }
        }
    }
}
