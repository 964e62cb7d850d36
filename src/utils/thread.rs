#![allow(unused)]

use anyhow::{anyhow, Result};
#[cfg(target_os = "linux")]
use std::ffi::CStr;

// pthread names are limited to 16 bytes including the null terminator.
#[cfg(target_os = "linux")]
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Gets the OS-level name of the current thread.
///
/// `std::thread::current().name()` only reports the name a thread was
/// spawned with, so worker identification goes through
/// `pthread_getname_np` on Linux.
#[cfg(target_os = "linux")]
pub(crate) fn get_current_thread_name() -> Result<String> {
    // Zero-initialized, so the buffer is guaranteed null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };
    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {}", ret));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("failed to convert thread name from CStr: {}", e))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    std::thread::current()
        .name()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("current thread has no name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_the_spawn_name() -> Result<()> {
        let handle = std::thread::Builder::new()
            .name("weft-name-check".into())
            .spawn(get_current_thread_name)?;
        let name = handle.join().expect("thread panicked")?;
        assert!(name.starts_with("weft-name-check"));
        Ok(())
    }
}
