//! Prometheus metrics formatting.
//!
//! Renders a `PoolMetrics` snapshot in the Prometheus text exposition format.

use std::fmt::Write;

use agentpool_core::{PoolMetrics, TaskPriority};

/// Format a metrics snapshot as Prometheus text.
pub fn render_prometheus(metrics: &PoolMetrics) -> String {
    let mut output = String::new();

    write_worker_metrics(metrics, &mut output);
    write_task_metrics(metrics, &mut output);
    write_pool_metrics(metrics, &mut output);

    output
}

fn write_worker_metrics(metrics: &PoolMetrics, output: &mut String) {
    let counts = &metrics.workers;

    writeln!(output, "# HELP agentpool_workers Number of workers by status").ok();
    writeln!(output, "# TYPE agentpool_workers gauge").ok();
    for (status, count) in [
        ("starting", counts.starting),
        ("idle", counts.idle),
        ("busy", counts.busy),
        ("error", counts.error),
        ("crashed", counts.crashed),
        ("stopping", counts.stopping),
    ] {
        writeln!(output, "agentpool_workers{{status=\"{status}\"}} {count}").ok();
    }
}

fn write_task_metrics(metrics: &PoolMetrics, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP agentpool_queue_depth Tasks waiting for a worker").ok();
    writeln!(output, "# TYPE agentpool_queue_depth gauge").ok();
    writeln!(output, "agentpool_queue_depth {}", metrics.queue_depth).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP agentpool_queue_depth_by_priority Tasks waiting per priority tier").ok();
    writeln!(output, "# TYPE agentpool_queue_depth_by_priority gauge").ok();
    for priority in TaskPriority::ALL {
        writeln!(
            output,
            "agentpool_queue_depth_by_priority{{priority=\"{}\"}} {}",
            priority.as_str(),
            metrics.queue_by_priority.get(priority)
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(output, "# HELP agentpool_tasks_total Tasks by status").ok();
    writeln!(output, "# TYPE agentpool_tasks_total gauge").ok();
    writeln!(output, "agentpool_tasks_total{{status=\"queued\"}} {}", metrics.queue_depth).ok();
    writeln!(output, "agentpool_tasks_total{{status=\"running\"}} {}", metrics.running_tasks).ok();
    writeln!(
        output,
        "agentpool_tasks_total{{status=\"completed\"}} {}",
        metrics.completed_tasks
    )
    .ok();
    writeln!(output, "agentpool_tasks_total{{status=\"failed\"}} {}", metrics.failed_tasks).ok();
    writeln!(
        output,
        "agentpool_tasks_total{{status=\"cancelled\"}} {}",
        metrics.cancelled_tasks
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP agentpool_task_duration_avg_ms Mean attempt duration in milliseconds"
    )
    .ok();
    writeln!(output, "# TYPE agentpool_task_duration_avg_ms gauge").ok();
    writeln!(output, "agentpool_task_duration_avg_ms {}", metrics.avg_task_duration_ms).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP agentpool_queue_wait_avg_ms Mean time from queued to assigned in milliseconds"
    )
    .ok();
    writeln!(output, "# TYPE agentpool_queue_wait_avg_ms gauge").ok();
    writeln!(output, "agentpool_queue_wait_avg_ms {}", metrics.avg_queue_wait_ms).ok();
}

fn write_pool_metrics(metrics: &PoolMetrics, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP agentpool_utilization Busy workers over live workers").ok();
    writeln!(output, "# TYPE agentpool_utilization gauge").ok();
    writeln!(output, "agentpool_utilization {}", metrics.utilization).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP agentpool_uptime_seconds Seconds since the pool started").ok();
    writeln!(output, "# TYPE agentpool_uptime_seconds counter").ok();
    writeln!(output, "agentpool_uptime_seconds {}", metrics.uptime_secs).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpool_core::{QueueDepths, WorkerCounts};

    #[test]
    fn test_render_empty_metrics() {
        let output = render_prometheus(&PoolMetrics::default());

        assert!(output.contains("agentpool_workers{status=\"idle\"} 0"));
        assert!(output.contains("agentpool_tasks_total{status=\"queued\"} 0"));
        assert!(output.contains("agentpool_queue_depth 0"));
        assert!(output.contains("agentpool_uptime_seconds 0"));
    }

    #[test]
    fn test_render_populated_metrics() {
        let metrics = PoolMetrics {
            workers: WorkerCounts {
                idle: 1,
                busy: 3,
                ..Default::default()
            },
            total_workers: 4,
            queue_depth: 7,
            queue_by_priority: QueueDepths {
                high: 4,
                background: 3,
                ..Default::default()
            },
            running_tasks: 3,
            completed_tasks: 12,
            failed_tasks: 2,
            utilization: 0.75,
            avg_task_duration_ms: 1500,
            ..Default::default()
        };
        let output = render_prometheus(&metrics);

        assert!(output.contains("agentpool_workers{status=\"busy\"} 3"));
        assert!(output.contains("agentpool_queue_depth 7"));
        assert!(output.contains("agentpool_queue_depth_by_priority{priority=\"high\"} 4"));
        assert!(output.contains("agentpool_queue_depth_by_priority{priority=\"medium\"} 0"));
        assert!(output.contains("agentpool_tasks_total{status=\"completed\"} 12"));
        assert!(output.contains("agentpool_tasks_total{status=\"failed\"} 2"));
        assert!(output.contains("agentpool_utilization 0.75"));
        assert!(output.contains("agentpool_task_duration_avg_ms 1500"));
        // Every sample has HELP and TYPE lines.
        assert_eq!(
            output.matches("# HELP").count(),
            output.matches("# TYPE").count()
        );
    }
}
