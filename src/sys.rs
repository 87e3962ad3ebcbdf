//! Privilege and resource-limit syscalls.

#![allow(unsafe_code)]

/// Whether the process runs with effective uid 0.
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Lift `RLIMIT_MEMLOCK` so kernel maps can be created on older kernels.
///
/// # Errors
///
/// Returns the OS error if `setrlimit` fails.
pub fn raise_memlock_limit() -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `limit` is a valid rlimit that outlives the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
