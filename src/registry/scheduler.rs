use super::NodeRegistry;
use crate::util::CancellationToken;
use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// Background thread that re-probes every registered node on a fixed interval.
pub struct ProbeScheduler {
    stop: CancellationToken,
    join: Option<thread::JoinHandle<()>>,
}

impl ProbeScheduler {
    pub fn spawn(registry: Arc<NodeRegistry>, interval: Duration) -> io::Result<Self> {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let join = thread::Builder::new()
            .name("bloomnet-probe".into())
            .spawn(move || loop {
                match registry.probe_all(SystemTime::now()) {
                    Ok(nodes) => debug!("event=probe_sweep nodes={}", nodes.len()),
                    Err(err) => warn!("event=probe_sweep_failed error={err}"),
                }
                if token.wait_timeout(interval) {
                    break;
                }
            })?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    pub fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("event=probe_scheduler_panic");
            }
        }
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
