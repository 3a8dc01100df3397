//! Process liveness check used by the stale-lock policy (spec.md 4.2) and by the
//! shutdown coordinator's drain sequence (spec.md 7).

/// Check if a process with the given PID is alive.
///
/// Sends signal 0 via `libc::kill`, which checks existence and permission without
/// actually signaling the process.
pub fn is_process_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(pid_i32) => {
            // SAFETY: signal 0 never terminates or otherwise affects the target
            // process; it only probes whether we're allowed to signal it.
            let result = unsafe { libc::kill(pid_i32, 0) };
            result == 0
        }
        Err(_) => false,
    }
}
