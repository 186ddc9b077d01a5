//! Human-readable event formatting for the CLI's presentation layer.
//!
//! The only place in this crate that uses raw `println!` instead of
//! `tracing` -- everything here is output the operator is meant to read,
//! not a log line destined for aggregation.

use choo_daemon::proto::Event;

pub fn print_event(event: &Event) {
    let mut line = format!("[{:>4}] {:<28} {}", event.sequence, event.event_type, event.timestamp);
    if let Some(unit_id) = &event.unit_id {
        line.push_str(&format!(" unit={unit_id}"));
    }
    if let Some(task) = event.task {
        line.push_str(&format!(" task={task}"));
    }
    if let Some(error) = &event.error {
        line.push_str(&format!(" error={error}"));
    }
    println!("{line}");
    if let Some(payload) = &event.payload_json {
        println!("         {payload}");
    }
}

/// Exit code conventions from the orchestrator CLI surface: `0` success,
/// `1` generic failure, `130` interrupted. Discovery/scheduling failures
/// (codes `2`/`3`) are surfaced by the daemon as `StartJob` errors rather
/// than a run status, since they abort before a run row exists.
pub fn exit_code_for_status(status: &str) -> i32 {
    match status {
        "completed" => 0,
        "cancelled" => 130,
        _ => 1,
    }
}
