//! Generic restart-with-backoff engine for supervised child processes.
//!
//! A [`SupervisedChild`] owns a subprocess's lifecycle (`start`/`watch`/`stop`/`is_running`)
//! plus an optional [`HealthCheck`]. [`SupervisedProcess`] is the concrete implementation most
//! children reuse: callers only implement [`ChildSpec`] (how to launch, how to ask the process
//! to terminate gracefully, and any post-exit cleanup); `SupervisedProcess` supplies the
//! termination escalation and bookkeeping. [`start_supervised`] then drives the
//! restart-with-backoff loop around any `SupervisedChild`.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use slog::{debug, error, info, o, warn, Logger};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{Mutex, Notify};

/// Grace period after the first graceful terminate before re-sending it.
pub const FIRST_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// Grace period after the second graceful terminate before sending a kill.
pub const FINAL_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("subprocess is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A periodic liveness check. [`HealthCheck::monitor`] counts *consecutive* failures and
/// returns once they exceed `retries`, which the supervision loop treats as "unhealthy."
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_ok(&self) -> bool;
    fn interval(&self) -> Duration;
    fn retries(&self) -> u32;

    async fn monitor(&self, log: &Logger) {
        let mut failures = 0u32;
        loop {
            tokio::time::sleep(self.interval()).await;
            if self.is_ok().await {
                failures = 0;
            } else {
                failures += 1;
                debug!(log, "health check failure"; "count" => failures, "retries" => self.retries());
                if failures > self.retries() {
                    return;
                }
            }
        }
    }
}

/// What the supervision loop expects of every supervised child.
#[async_trait]
pub trait SupervisedChild: Send + Sync {
    /// Spawn the child. Fails fast with [`Error::AlreadyRunning`] if already running.
    async fn start(&self) -> Result<(), Error>;
    /// Block until the child exits, running the termination escalation if `stop` was called
    /// during the wait. Always cleans up owned handles before returning.
    async fn watch(&self);
    /// Idempotent: signals stop and sends a best-effort terminate to any running child.
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// An optional liveness probe for this child.
    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        None
    }
}

/// How a [`SupervisedProcess`] launches and terminates its concrete child.
#[async_trait]
pub trait ChildSpec: Send + Sync {
    /// Spawn the child, or return `Ok(None)` if launch failed in a way that should be logged
    /// and treated as a normal (non-crashing) exit rather than an error.
    async fn launch(&self) -> std::io::Result<Option<Child>>;

    /// Ask the child to terminate gracefully. Default sends `SIGTERM` by pid, tolerating
    /// "process already gone."
    async fn request_terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    /// Called after the child has exited and any termination escalation has completed.
    async fn cleanup(&self, _stopped: bool) {}

    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        None
    }
}

/// Generic [`SupervisedChild`] built from a [`ChildSpec`].
pub struct SupervisedProcess<S> {
    spec: S,
    name: String,
    log: Logger,
    child: Mutex<Option<Child>>,
    pid: AtomicI32,
    stop_notify: Notify,
    stopped: AtomicBool,
}

impl<S: ChildSpec> SupervisedProcess<S> {
    pub fn new(name: impl Into<String>, spec: S, log: Logger) -> Arc<Self> {
        let name = name.into();
        let log = log.new(o!("child" => name.clone()));
        Arc::new(Self {
            spec,
            name,
            log,
            child: Mutex::new(None),
            pid: AtomicI32::new(0),
            stop_notify: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn spec(&self) -> &S {
        &self.spec
    }

    async fn terminate_escalation(&self, child: &mut Child) {
        self.spec.request_terminate(child).await;
        if tokio::time::timeout(FIRST_GRACE_PERIOD, child.wait())
            .await
            .is_ok()
        {
            return;
        }

        warn!(self.log, "did not terminate within grace period, retrying terminate";
            "seconds" => FIRST_GRACE_PERIOD.as_secs());
        self.spec.request_terminate(child).await;
        if tokio::time::timeout(FINAL_GRACE_PERIOD, child.wait())
            .await
            .is_ok()
        {
            return;
        }

        warn!(self.log, "did not terminate after another grace period, sending kill";
            "seconds" => FINAL_GRACE_PERIOD.as_secs());
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[async_trait]
impl<S: ChildSpec + Send + Sync> SupervisedChild for SupervisedProcess<S> {
    async fn start(&self) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        self.stopped.store(false, Ordering::SeqCst);

        let maybe_child = self.spec.launch().await?;
        if let Some(child) = &maybe_child {
            if let Some(pid) = child.id() {
                self.pid.store(pid as i32, Ordering::SeqCst);
            }
        }
        *self.child.lock().await = maybe_child;
        Ok(())
    }

    async fn watch(&self) {
        let child_opt = self.child.lock().await.take();
        let Some(mut child) = child_opt else {
            return;
        };

        let exited_naturally = tokio::select! {
            status = child.wait() => {
                if let Ok(status) = status {
                    debug!(self.log, "subprocess exited"; "status" => %status);
                }
                true
            }
            _ = self.stop_notify.notified() => false,
        };

        if !exited_naturally {
            self.terminate_escalation(&mut child).await;
        }

        let stopped = self.stopped.load(Ordering::SeqCst);
        self.spec.cleanup(stopped).await;
        self.pid.store(0, Ordering::SeqCst);
        info!(self.log, "supervised process exited"; "name" => &self.name, "stopped" => stopped);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
        let pid = self.pid.load(Ordering::SeqCst);
        if pid != 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }

    fn is_running(&self) -> bool {
        self.pid.load(Ordering::SeqCst) != 0
    }

    fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        self.spec.health_check()
    }
}

/// Race `child.watch()` against an external stop signal and any health-check failure. If the
/// external signal or a failing health check wins, `stop()` the child and wait for its own
/// `watch()` (already in flight) to finish the termination escalation.
async fn watch_with_interrupts(
    name: &str,
    child: Arc<dyn SupervisedChild>,
    stop_rx: async_channel::Receiver<()>,
    log: &Logger,
) {
    let mut watch_task = tokio::spawn({
        let child = child.clone();
        async move { child.watch().await }
    });

    let health = child.health_check();
    let mut health_task = health.map(|hc| {
        let log = log.clone();
        tokio::spawn(async move { hc.monitor(&log).await })
    });

    tokio::select! {
        res = &mut watch_task => {
            if let Err(err) = res {
                error!(log, "supervised watch task panicked"; "name" => name, "error" => %err);
            }
            if let Some(h) = health_task {
                h.abort();
            }
        }
        _ = stop_rx.recv() => {
            child.stop();
            let _ = watch_task.await;
        }
        _ = async {
            match &mut health_task {
                Some(h) => { let _ = h.await; }
                None => futures::future::pending().await,
            }
        } => {
            info!(log, "stopping due to failing health checks"; "name" => name);
            child.stop();
            let _ = watch_task.await;
        }
    }
}

async fn supervise(
    name: String,
    child: Arc<dyn SupervisedChild>,
    retry_delay: Duration,
    stop_rx: async_channel::Receiver<()>,
    log: Logger,
) {
    loop {
        let started_at = Instant::now();
        watch_with_interrupts(&name, child.clone(), stop_rx.clone(), &log).await;
        info!(log, "supervised process exited"; "name" => &name);

        if stop_rx.is_closed() {
            return;
        }

        let elapsed = started_at.elapsed();
        if elapsed < retry_delay {
            let remaining = retry_delay - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = stop_rx.recv() => {}
            }
        }

        if stop_rx.is_closed() {
            return;
        }

        match child.start().await {
            Ok(()) => info!(log, "started supervised process"; "name" => &name),
            Err(err) => error!(log, "error starting supervised process"; "name" => &name, "error" => %err),
        }
    }
}

/// Start `child`, then spawn a task driving the restart-with-backoff supervision loop until
/// `stop_tx` (paired with the `stop_rx` given here) is signaled.
pub async fn start_supervised(
    name: impl Into<String>,
    child: Arc<dyn SupervisedChild>,
    retry_delay: Duration,
    stop_rx: async_channel::Receiver<()>,
    log: Logger,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    let name = name.into();
    child.start().await?;
    info!(log, "started supervised process"; "name" => &name);
    Ok(tokio::spawn(supervise(name, child, retry_delay, stop_rx, log)))
}

/// Start several supervised children concurrently. Returns once each has either completed
/// `start()` or raised; a raised error fails the whole batch (the caller is expected to tear
/// down whatever did start).
pub async fn start_supervised_multi(
    children: Vec<(String, Arc<dyn SupervisedChild>)>,
    retry_delay: Duration,
    stop_rx: async_channel::Receiver<()>,
    log: Logger,
) -> Result<Vec<tokio::task::JoinHandle<()>>, Error> {
    if children.is_empty() {
        return Ok(Vec::new());
    }

    let starts = children
        .into_iter()
        .map(|(name, child)| start_supervised(name, child, retry_delay, stop_rx.clone(), log.clone()));
    futures::future::try_join_all(starts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::atomic::AtomicU32;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    struct SleepSpec {
        seconds: u32,
        launches: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ChildSpec for SleepSpec {
        async fn launch(&self) -> std::io::Result<Option<Child>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let child = tokio::process::Command::new("sleep")
                .arg(self.seconds.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            Ok(Some(child))
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let launches = Arc::new(AtomicU32::new(0));
        let proc = SupervisedProcess::new(
            "sleeper",
            SleepSpec {
                seconds: 5,
                launches: launches.clone(),
            },
            test_logger(),
        );
        proc.start().await.unwrap();
        assert!(matches!(proc.start().await, Err(Error::AlreadyRunning)));
        proc.stop();
        proc.watch().await;
    }

    #[tokio::test]
    async fn stop_terminates_within_grace_period() {
        let launches = Arc::new(AtomicU32::new(0));
        let proc = SupervisedProcess::new(
            "sleeper",
            SleepSpec {
                seconds: 60,
                launches,
            },
            test_logger(),
        );
        proc.start().await.unwrap();
        assert!(proc.is_running());

        let watch_handle = tokio::spawn({
            let proc = proc.clone();
            async move { proc.watch().await }
        });
        proc.stop();

        tokio::time::timeout(Duration::from_secs(3), watch_handle)
            .await
            .expect("watch should finish well within the escalation window")
            .unwrap();
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn supervise_restarts_after_unexpected_exit() {
        let launches = Arc::new(AtomicU32::new(0));
        let proc: Arc<dyn SupervisedChild> = SupervisedProcess::new(
            "quick",
            SleepSpec {
                seconds: 0,
                launches: launches.clone(),
            },
            test_logger(),
        );
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let handle = start_supervised(
            "quick",
            proc,
            Duration::from_millis(50),
            stop_rx,
            test_logger(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop_tx.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(launches.load(Ordering::SeqCst) >= 2, "expected at least one restart");
    }

    struct SlowStartSpec {
        startup_delay: Duration,
    }

    #[async_trait]
    impl ChildSpec for SlowStartSpec {
        async fn launch(&self) -> std::io::Result<Option<Child>> {
            tokio::time::sleep(self.startup_delay).await;
            let child = tokio::process::Command::new("sleep")
                .arg("5")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            Ok(Some(child))
        }
    }

    #[tokio::test]
    async fn start_supervised_multi_starts_children_concurrently() {
        let startup_delay = Duration::from_millis(200);
        let children: Vec<(String, Arc<dyn SupervisedChild>)> = (0..4)
            .map(|i| {
                let child: Arc<dyn SupervisedChild> =
                    SupervisedProcess::new(format!("slow-{i}"), SlowStartSpec { startup_delay }, test_logger());
                (format!("slow-{i}"), child)
            })
            .collect();

        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let started = Instant::now();
        let handles = start_supervised_multi(children, Duration::from_secs(5), stop_rx, test_logger())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(handles.len(), 4);
        assert!(
            elapsed < startup_delay * 2,
            "four concurrent starts took {elapsed:?}, expected well under {:?} if run concurrently",
            startup_delay * 2
        );

        stop_tx.close();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}
