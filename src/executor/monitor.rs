//! Periodic instance monitoring.
//!
//! Every tick the loop refreshes the process table once, walks every known
//! instance directory and pushes one [`InstanceStatusReport`] per instance to
//! the sink. IO rates are derived from cumulative byte counters sampled on
//! consecutive ticks, so the first observation of a process reports zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::executor::manifest::{read_pid, ServiceManifest};
use crate::executor::process::expected_bin;
use crate::executor::{Executor, STATUS_RUNNING, STATUS_STOPPED};
use crate::protocol::messages::InstanceStatusReport;

struct IoPrev {
    read_bytes: u64,
    written_bytes: u64,
    at: Instant,
    pid: u32,
}

/// Run until cancelled. Interval changes via
/// [`Executor::set_monitor_interval`] take effect on the next wakeup.
pub async fn run_monitor(executor: Arc<Executor>, shutdown: CancellationToken) {
    let mut interval_rx = executor.monitor_interval();
    let mut io_prev: HashMap<String, IoPrev> = HashMap::new();

    loop {
        let interval = *interval_rx.borrow_and_update();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("monitor loop stopping");
                return;
            }
            _ = interval_rx.changed() => {
                trace!("monitor interval changed");
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let instances = executor.known_instances();
        {
            let mut table = executor.table().lock().await;
            table.refresh_all();

            let now = Instant::now();
            for inst in &instances {
                let report =
                    sample_instance(&table, &inst.dir, &inst.instance_id, &mut io_prev, now);
                executor.sink().report(report);
            }
        }
        // Drop cache entries for instances that disappeared.
        io_prev.retain(|id, _| instances.iter().any(|i| i.instance_id == *id));
    }
}

fn sample_instance(
    table: &crate::executor::validate::ProcessTable,
    dir: &std::path::Path,
    instance_id: &str,
    io_prev: &mut HashMap<String, IoPrev>,
    now: Instant,
) -> InstanceStatusReport {
    let mf = ServiceManifest::read(dir).unwrap_or_default();
    let exec_dir = mf.exec_dir(dir);

    let pid = read_pid(dir).filter(|&p| table.validate(p, &exec_dir, &expected_bin(&mf)));
    let Some(pid) = pid else {
        io_prev.remove(instance_id);
        return InstanceStatusReport::transition(instance_id, STATUS_STOPPED, 0, 0);
    };

    let sample = table.sample(pid).unwrap_or_default();
    let (io_read, io_write) = match io_prev.get(instance_id) {
        // PID change means the counters reset; skip one tick.
        Some(prev) if prev.pid == pid => {
            let elapsed = now.duration_since(prev.at).as_secs_f64().max(0.001);
            let rd = sample.disk_read_bytes.saturating_sub(prev.read_bytes);
            let wr = sample.disk_written_bytes.saturating_sub(prev.written_bytes);
            (
                (rd as f64 / elapsed / 1024.0) as u64,
                (wr as f64 / elapsed / 1024.0) as u64,
            )
        }
        _ => (0, 0),
    };
    io_prev.insert(
        instance_id.to_string(),
        IoPrev {
            read_bytes: sample.disk_read_bytes,
            written_bytes: sample.disk_written_bytes,
            at: now,
            pid,
        },
    );

    InstanceStatusReport {
        instance_id: instance_id.to_string(),
        status: STATUS_RUNNING.to_string(),
        pid,
        uptime: sample.start_time_secs as i64,
        cpu_usage: sample.cpu_percent as f64,
        mem_usage: sample.mem_bytes / (1024 * 1024),
        io_read,
        io_write,
    }
}
