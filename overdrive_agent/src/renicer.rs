//! Background loop re-asserting nice levels for processes whose profile asked
//! for `proc.nice.watch`. The loop lives while at least one pid is enrolled.

use crate::system;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Default)]
struct RenicerInner {
    /// pid -> (expected nice level, originating request pid)
    pid_nice: HashMap<i32, (i32, i32)>,
    watching: bool,
}

pub struct Renicer {
    interval: f64,
    inner: Mutex<RenicerInner>,
}

pub fn get_priority(pid: i32) -> Option<i32> {
    nix::errno::Errno::clear();
    let res = unsafe { libc::getpriority(libc::PRIO_PROCESS as _, pid as libc::id_t) };
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if res == -1 && errno != 0 {
        None
    } else {
        Some(res)
    }
}

pub fn set_priority(pid: i32, level: i32, request_pid: i32) -> bool {
    let res = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, level) };
    if res == 0 {
        info!("process {pid} nice level changed to '{level}' (request={request_pid})");
        true
    } else {
        error!("could not change process {pid} nice level to {level} (request={request_pid})");
        false
    }
}

impl Renicer {
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            inner: Mutex::new(RenicerInner::default()),
        }
    }

    /// Enrolls a pid; returns false when it is already monitored.
    pub async fn add(&self, pid: i32, nice_level: i32, request_pid: i32) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.pid_nice.contains_key(&pid) {
            debug!("process {pid} nice level is already being monitored (request={request_pid})");
            return false;
        }
        inner.pid_nice.insert(pid, (nice_level, request_pid));
        info!("process {pid} nice level will be monitored (request={request_pid})");
        true
    }

    pub async fn is_watching(&self) -> bool {
        self.inner.lock().await.watching
    }

    /// Spawns the monitoring loop when not already running.
    pub async fn watch(self: Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.watching || inner.pid_nice.is_empty() {
            return false;
        }
        inner.watching = true;
        drop(inner);

        tokio::spawn(async move {
            self.run_loop().await;
        });
        true
    }

    async fn run_loop(&self) {
        loop {
            let pids_alive = system::read_current_pids();
            {
                let mut inner = self.inner.lock().await;
                let mut dead = Vec::new();

                for (pid, (level, request_pid)) in &inner.pid_nice {
                    if !pids_alive.contains(pid) {
                        dead.push(*pid);
                        continue;
                    }
                    let current = get_priority(*pid);
                    if current != Some(*level) {
                        debug!(
                            "process {pid} current nice level ({current:?}) differs from expected ({level}) \
                             (request={request_pid})"
                        );
                        set_priority(*pid, *level, *request_pid);
                    }
                }

                if !dead.is_empty() {
                    for pid in &dead {
                        inner.pid_nice.remove(pid);
                    }
                    debug!(
                        "stop monitoring the nice level of processes: {}",
                        dead.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
                    );
                }

                if inner.pid_nice.is_empty() {
                    inner.watching = false;
                    break;
                }
            }

            tokio::time::sleep(Duration::from_secs_f64(self.interval.max(0.1))).await;
        }
        debug!("stopped monitoring nice levels");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_priority_is_readable() {
        let pid = std::process::id() as i32;
        assert!(get_priority(pid).is_some());
    }

    #[test]
    fn unknown_pid_has_no_priority() {
        assert_eq!(get_priority(-12345), None);
    }

    #[tokio::test]
    async fn add_refuses_duplicates() {
        let renicer = Renicer::new(5.0);
        assert!(renicer.add(99999, 0, 1).await);
        assert!(!renicer.add(99999, -5, 1).await);
    }

    #[tokio::test]
    async fn nice_level_converges_for_live_processes() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;
        let current = get_priority(pid).expect("child priority");
        // raising the nice level never needs privileges
        let target = (current + 2).min(19);

        let renicer = Arc::new(Renicer::new(0.1));
        renicer.add(pid, target, 1).await;
        assert!(renicer.clone().watch().await);

        let mut converged = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if get_priority(pid) == Some(target) {
                converged = true;
                break;
            }
        }
        let _ = child.kill();
        let _ = child.wait();
        assert!(converged, "nice level did not converge to {target}");
    }

    #[tokio::test]
    async fn loop_exits_when_all_pids_die() {
        let renicer = Arc::new(Renicer::new(0.05));
        // enroll a pid that is guaranteed dead
        renicer.add(i32::MAX - 1, 0, 1).await;
        assert!(renicer.clone().watch().await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!renicer.is_watching().await);
    }
}
