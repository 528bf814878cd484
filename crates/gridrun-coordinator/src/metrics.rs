//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use gridrun_core::TaskStatus;

use crate::coordinator::Coordinator;

/// Collect all metrics from the coordinator and format as Prometheus text.
pub async fn collect_metrics(coordinator: &Coordinator) -> String {
    let mut output = String::new();

    collect_worker_metrics(coordinator, &mut output).await;
    collect_task_metrics(coordinator, &mut output).await;
    collect_credit_metrics(coordinator, &mut output).await;

    output
}

/// Collect worker metrics by availability.
async fn collect_worker_metrics(coordinator: &Coordinator, output: &mut String) {
    let stats = coordinator.get_stats().await;
    let idle = stats.clients.available;
    let busy = stats.clients.connected - stats.clients.available;

    writeln!(
        output,
        "# HELP gridrun_workers_connected Number of connected workers by state"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_workers_connected gauge").ok();
    writeln!(output, "gridrun_workers_connected{{state=\"idle\"}} {idle}").ok();
    writeln!(output, "gridrun_workers_connected{{state=\"busy\"}} {busy}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_workers_tflops Summed self-reported TFLOPS of connected workers"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_workers_tflops gauge").ok();
    writeln!(output, "gridrun_workers_tflops {}", stats.clients.total_tflops).ok();
}

/// Collect task metrics by status.
async fn collect_task_metrics(coordinator: &Coordinator, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_tasks Number of tracked tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_tasks gauge").ok();
    for (status, count) in coordinator.task_counts().await {
        writeln!(
            output,
            "gridrun_tasks{{status=\"{}\"}} {count}",
            status_label(status)
        )
        .ok();
    }
}

/// Collect lifetime credit and compute totals.
async fn collect_credit_metrics(coordinator: &Coordinator, output: &mut String) {
    let totals = coordinator.get_stats().await.totals;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_credits_awarded_total Credits awarded to workers"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_credits_awarded_total counter").ok();
    writeln!(output, "gridrun_credits_awarded_total {}", totals.credits_awarded).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_compute_seconds_total Compute time reported by workers"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_compute_seconds_total counter").ok();
    writeln!(output, "gridrun_compute_seconds_total {}", totals.total_compute_time).ok();
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Assigned => "assigned",
        TaskStatus::Processing => "processing",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Timeout => "timeout",
        TaskStatus::Cancelled => "cancelled",
    }
}
