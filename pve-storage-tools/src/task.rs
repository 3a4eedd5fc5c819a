use anyhow::Error;

/// Methods commonly used by long running storage operations, independent of
/// the task executor running them.
pub trait WorkerTaskContext {
    /// If the task should be aborted, this should fail with a reasonable error message.
    fn check_abort(&self) -> Result<(), Error>;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);
}

/// Convenience implementation:
impl<T: WorkerTaskContext + ?Sized> WorkerTaskContext for std::sync::Arc<T> {
    fn check_abort(&self) -> Result<(), Error> {
        <T as WorkerTaskContext>::check_abort(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as WorkerTaskContext>::log(self, level, message)
    }
}

/// Task context which forwards everything to the `log` facade.
///
/// Used when there is no worker task, e.g. on the command line.
pub struct LogTaskContext {
    prefix: String,
}

impl LogTaskContext {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl WorkerTaskContext for LogTaskContext {
    fn check_abort(&self) -> Result<(), Error> {
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        if self.prefix.is_empty() {
            log::log!(level, "{}", message);
        } else {
            log::log!(level, "{}: {}", self.prefix, message);
        }
    }
}

/// Run a step whose failure must not abort the surrounding operation.
///
/// Errors are logged as warning (prefixed with `what`) and turned into `None`.
pub fn try_best_effort<T, F>(task: &dyn WorkerTaskContext, what: &str, op: F) -> Option<T>
where
    F: FnOnce() -> Result<T, Error>,
{
    match op() {
        Ok(value) => Some(value),
        Err(err) => {
            task.log(log::Level::Warn, &format_args!("{} failed - {}", what, err));
            None
        }
    }
}

#[macro_export]
macro_rules! task_error {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Error, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Warn, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Info, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_debug {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Debug, &format_args!($($fmt)+))
    }};
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    struct Collect(Mutex<Vec<(log::Level, String)>>);

    impl WorkerTaskContext for Collect {
        fn check_abort(&self) -> Result<(), Error> {
            Ok(())
        }

        fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_best_effort_logs_warning() {
        let task = Collect(Mutex::new(Vec::new()));

        let res: Option<()> = try_best_effort(&task, "thaw filesystem", || bail!("no agent"));
        assert!(res.is_none());
        assert_eq!(try_best_effort(&task, "noop", || Ok(5)), Some(5));

        let lines = task.0.lock().unwrap();
        assert_eq!(
            *lines,
            vec![(log::Level::Warn, "thaw filesystem failed - no agent".to_string())]
        );
    }
}
