use std::future::Future;

/// Runs a future to completion on a dedicated current-thread runtime.
/// Used by the synchronous facade, which parks a background thread on the
/// server future.
pub(crate) fn block_on_current_thread<F, O>(f: F) -> O
where
    F: Future<Output = O>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("cannot build local tokio runtime");

    runtime.block_on(f)
}
