use std::future::Future;
use std::time::Instant;

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Guard emitting the `futures.done` metric, tagged `canceled` unless marked as done.
struct MeasureGuard<'a> {
    status: Option<&'static str>,
    task_name: &'a str,
    creation_time: Instant,
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        metric!(
            timer("futures.done") = self.creation_time.elapsed(),
            "task_name" => self.task_name,
            "status" => self.status.unwrap_or("canceled"),
        );
    }
}

/// Measures the duration of a future and reports it as `futures.done`.
///
/// The metric is tagged with the status derived by `get_status`, or `canceled` if the future is
/// dropped before completing.
pub fn measure<'a, S, F>(
    task_name: &'a str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output> + 'a
where
    F: 'a + Future,
    S: 'a + FnOnce(&F::Output) -> &'static str,
{
    let mut guard = MeasureGuard {
        status: None,
        task_name,
        creation_time: Instant::now(),
    };

    async move {
        let output = f.await;
        guard.status = Some(get_status(&output));
        output
    }
}

/// Status helpers for [`measure`].
pub mod m {
    /// `"ok"` if the future resolves to `Ok(_)`, `"err"` otherwise.
    pub fn result<T, E>(result: &Result<T, E>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(_) => "err",
        }
    }
}
