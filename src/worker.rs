//! Deferred work (worker jobs) and the executor contract.
//!
//! Slow operations (zeroing removed volumes, copies, replication) are handed
//! out as [`WorkerJob`]s. Running them (in a separate thread or process,
//! capturing the log, tracking status) is the business of a [`TaskExecutor`].

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Error;

use pve_storage_tools::task::{LogTaskContext, WorkerTaskContext};

type WorkerFn = Box<dyn FnOnce(&dyn WorkerTaskContext) -> Result<(), Error> + Send>;

/// A unit of work to be run as background task.
pub struct WorkerJob {
    worker_type: String,
    worker_id: Option<String>,
    func: WorkerFn,
}

impl WorkerJob {
    pub fn new<F>(worker_type: &str, worker_id: Option<String>, func: F) -> Self
    where
        F: FnOnce(&dyn WorkerTaskContext) -> Result<(), Error> + Send + 'static,
    {
        Self {
            worker_type: worker_type.to_string(),
            worker_id,
            func: Box::new(func),
        }
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    /// Run the job in the current thread.
    pub fn run(self, task: &dyn WorkerTaskContext) -> Result<(), Error> {
        (self.func)(task)
    }
}

impl std::fmt::Debug for WorkerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WorkerJob")
            .field("worker_type", &self.worker_type)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Runs worker jobs.
pub trait TaskExecutor: Send + Sync {
    /// Start the job and return a task ID.
    ///
    /// A failing job must not fail the caller, the failure belongs into the task log.
    fn spawn(&self, job: WorkerJob) -> Result<String, Error>;
}

static TASK_COUNTER: AtomicU64 = AtomicU64::new(0);

fn task_id(job: &WorkerJob) -> String {
    format!(
        "{}:{}:{:08X}:{}",
        job.worker_type(),
        job.worker_id().unwrap_or(""),
        proxmox_time::epoch_i64(),
        TASK_COUNTER.fetch_add(1, Ordering::SeqCst),
    )
}

/// Runs jobs synchronously in the calling thread, logging through the `log` facade.
///
/// Used by the command line tools and tests.
#[derive(Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn spawn(&self, job: WorkerJob) -> Result<String, Error> {
        let upid = task_id(&job);
        let task = LogTaskContext::new(upid.clone());

        log::info!("starting task {}", upid);
        match job.run(&task) {
            Ok(()) => log::info!("task {} finished - OK", upid),
            Err(err) => log::error!("task {} failed - {}", upid, err),
        }

        Ok(upid)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::*;

    #[test]
    fn test_inline_executor() -> Result<(), Error> {
        let ran = Arc::new(Mutex::new(Vec::new()));

        let ran2 = Arc::clone(&ran);
        let job = WorkerJob::new("imgdel", Some("local:100/vm-100-disk-0.raw".into()), move |_| {
            ran2.lock().unwrap().push("first");
            Ok(())
        });
        let upid = InlineExecutor.spawn(job)?;
        assert!(upid.starts_with("imgdel:local:100/vm-100-disk-0.raw:"));

        // failures end up in the log, not at the caller
        let ran2 = Arc::clone(&ran);
        let job = WorkerJob::new("imgdel", None, move |_| {
            ran2.lock().unwrap().push("second");
            bail!("zeroing failed");
        });
        InlineExecutor.spawn(job)?;

        assert_eq!(*ran.lock().unwrap(), ["first", "second"]);
        Ok(())
    }
}
