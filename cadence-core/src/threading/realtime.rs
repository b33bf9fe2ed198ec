//! Realtime scheduling for timing-sensitive threads

/// Move the calling thread to `SCHED_RR` at the highest priority
#[cfg(target_os = "linux")]
pub fn set_realtime_priority() -> anyhow::Result<()> {
    let priority = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
    if priority < 0 {
        anyhow::bail!("sched_get_priority_max failed: {}", std::io::Error::last_os_error());
    }
    let param = libc::sched_param { sched_priority: priority };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        anyhow::bail!(
            "Failed to set SCHED_RR priority {} (needs CAP_SYS_NICE): {}",
            priority,
            std::io::Error::last_os_error()
        );
    }
    tracing::debug!("Running with SCHED_RR priority {}", priority);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority() -> anyhow::Result<()> {
    anyhow::bail!("Realtime scheduling is only supported on Linux")
}

/// Lock current and future pages into memory
#[cfg(unix)]
pub fn lock_memory() -> anyhow::Result<()> {
    use nix::sys::mman::{mlockall, MlockAllFlags};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(|e| anyhow::anyhow!("mlockall failed (needs CAP_IPC_LOCK): {}", e))?;
    tracing::debug!("Process memory locked");
    Ok(())
}

#[cfg(not(unix))]
pub fn lock_memory() -> anyhow::Result<()> {
    anyhow::bail!("Memory locking is not supported on this platform")
}
