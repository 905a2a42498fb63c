// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Throttled buildcache reindexing
//!
//! Completed builds signal the [`Scheduler`]; a periodic tick runs the
//! configured reindex command only when a signal arrived since the last
//! tick. At most one subprocess runs at a time and any number of requests
//! arriving meanwhile coalesce into a single follow-up run.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{process::Command, sync::watch, time};
use tracing::{debug, error};

pub struct Scheduler {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
}

struct Inner {
    period: Duration,
    /// argv of the reindex operation
    command: Vec<String>,
    gate: Mutex<Gate>,
    stopped: watch::Receiver<bool>,
}

#[derive(Default)]
struct Gate {
    signalled: bool,
    running: bool,
    queued: bool,
}

impl Scheduler {
    pub fn new(period: Duration, command: Vec<String>) -> Self {
        let (stop, stopped) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                period,
                command,
                gate: Mutex::default(),
                stopped,
            }),
            stop,
        }
    }

    /// The production reindex operation
    pub fn update_index_command(spack_executable: &str, cache_url: &str) -> Vec<String> {
        vec![
            spack_executable.to_owned(),
            "buildcache".to_owned(),
            "update-index".to_owned(),
            "--".to_owned(),
            cache_url.to_owned(),
        ]
    }

    /// Enter the periodic loop
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let mut stopped = self.stop.subscribe();

        tokio::spawn(async move {
            let mut ticker = time::interval(inner.period);
            // the first tick of an interval fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let armed = {
                            let mut gate = inner.gate.lock().expect("reindex gate lock");
                            std::mem::take(&mut gate.signalled)
                        };
                        if armed {
                            Inner::request(&inner);
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
    }

    /// Arm the gate so the next periodic tick runs the operation
    pub fn signal(&self) {
        if *self.stop.borrow() {
            return;
        }

        self.inner.gate.lock().expect("reindex gate lock").signalled = true;
    }

    /// Stop the periodic loop. A subprocess that is already running is left
    /// to finish
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Inner {
    /// Run the operation, or queue exactly one follow-up if it already is
    fn request(self: &Arc<Self>) {
        {
            let mut gate = self.gate.lock().expect("reindex gate lock");
            if gate.running {
                gate.queued = true;
                return;
            }
            gate.running = true;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                inner.run_once().await;

                let mut gate = inner.gate.lock().expect("reindex gate lock");
                if gate.queued && !*inner.stopped.borrow() {
                    gate.queued = false;
                } else {
                    gate.running = false;
                    break;
                }
            }
        });
    }

    async fn run_once(&self) {
        let (executable, args) = self.command.split_first().expect("non-empty reindex command");

        debug!("updating buildcache index");

        match Command::new(executable).args(args).output().await {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));

                // the external tool does not always exit non-zero on failure
                if !output.status.success() || combined.contains("Error") {
                    error!(status = %output.status, "buildcache reindex failed: {}", combined.trim());
                }
            }
            Err(err) => {
                error!("failed to spawn reindex command {executable:?}: {err}");
            }
        }
    }
}
