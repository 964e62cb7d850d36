use std::io;
use std::sync::OnceLock;

/// Number of logical CPUs, cached after the first query. Respects cgroup
/// limits and affinity masks, unlike a raw sysconf.
pub(crate) fn num_logical_cpus() -> usize {
    static CPUS: OnceLock<usize> = OnceLock::new();
    *CPUS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// Brief busy pause between steal attempts to reduce coherence traffic on
/// the victim's indices.
#[inline(always)]
pub(crate) fn pause_cpu(cycles: usize) {
    for _ in 0..cycles {
        std::hint::spin_loop();
    }
}

/// Upper bound on core indices accepted by the affinity API; anything at
/// or above this would index past `cpu_set_t`.
#[cfg(target_os = "linux")]
const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

/// Pins the calling thread to `core`.
#[cfg(target_os = "linux")]
pub(crate) fn pin_current_thread(core: usize) -> io::Result<()> {
    if core >= CPU_SET_CAPACITY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core index {core} exceeds cpu_set_t capacity"),
        ));
    }

    // Safety: a zeroed cpu_set_t is valid, and `core` was bounds-checked
    // above so CPU_SET stays inside the mask.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);

        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set as *const _,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_current_thread(_core: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_logical_cpus_is_positive() {
        assert!(num_logical_cpus() >= 1);
    }

    #[test]
    fn pause_cpu_returns() {
        pause_cpu(32);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn pin_rejects_out_of_bounds_core() {
        assert!(pin_current_thread(usize::MAX).is_err());
    }
}
