//! Syscall allow-list installed by the worker child before it serves its
//! first call.
//!
//! The filter admits only what the engine and the runtime need: file
//! reads/writes, memory management, signal handling, thread creation and
//! synchronization, the socket calls backing the two sandbox channels, and
//! process/identity queries. Everything else kills the process, which the
//! host observes as a worker crash.

#[cfg(target_os = "linux")]
pub(crate) fn install() -> sandcell_common::Result<()> {
    use std::collections::BTreeMap;

    use sandcell_common::{Error, StatusKind};
    use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

    let arch = TargetArch::try_from(std::env::consts::ARCH).map_err(|_| {
        Error::new(
            StatusKind::SandboxInitFailed,
            format!("no syscall table for `{}`", std::env::consts::ARCH),
        )
    })?;
    let rules: BTreeMap<i64, Vec<SeccompRule>> = allowed_syscalls()
        .into_iter()
        .map(|syscall| (syscall as i64, Vec::new()))
        .collect();
    let filter = SeccompFilter::new(rules, SeccompAction::KillProcess, SeccompAction::Allow, arch)
        .map_err(|e| Error::new(StatusKind::SandboxInitFailed, e.to_string()))?;
    let program: BpfProgram = filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            Error::new(StatusKind::SandboxInitFailed, e.to_string())
        })?;
    seccompiler::apply_filter(&program)
        .map_err(|e| Error::new(StatusKind::SandboxInitFailed, e.to_string()))
}

#[cfg(target_os = "linux")]
fn allowed_syscalls() -> Vec<libc::c_long> {
    let mut syscalls = vec![
        // file and socket IO
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_readv,
        libc::SYS_writev,
        libc::SYS_pread64,
        libc::SYS_pwrite64,
        libc::SYS_openat,
        libc::SYS_close,
        libc::SYS_lseek,
        libc::SYS_fcntl,
        libc::SYS_recvmsg,
        libc::SYS_sendmsg,
        libc::SYS_fstat,
        libc::SYS_newfstatat,
        libc::SYS_statx,
        libc::SYS_readlinkat,
        // memory management
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_mprotect,
        libc::SYS_madvise,
        libc::SYS_brk,
        libc::SYS_membarrier,
        // signals
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_rt_sigreturn,
        libc::SYS_sigaltstack,
        libc::SYS_tgkill,
        // threads and scheduling
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_futex,
        libc::SYS_rseq,
        libc::SYS_set_robust_list,
        libc::SYS_sched_yield,
        libc::SYS_sched_getaffinity,
        libc::SYS_prctl,
        // time
        libc::SYS_nanosleep,
        libc::SYS_clock_nanosleep,
        libc::SYS_clock_gettime,
        libc::SYS_clock_getres,
        libc::SYS_gettimeofday,
        // process and identity queries
        libc::SYS_getpid,
        libc::SYS_gettid,
        libc::SYS_getppid,
        libc::SYS_getuid,
        libc::SYS_geteuid,
        libc::SYS_getgid,
        libc::SYS_getegid,
        libc::SYS_getrlimit,
        libc::SYS_prlimit64,
        libc::SYS_uname,
        libc::SYS_getrandom,
        // exit
        libc::SYS_exit,
        libc::SYS_exit_group,
    ];

    #[cfg(target_arch = "x86_64")]
    syscalls.extend([
        libc::SYS_open,
        libc::SYS_stat,
        libc::SYS_lstat,
        libc::SYS_readlink,
        libc::SYS_time,
        libc::SYS_fork,
        libc::SYS_vfork,
        libc::SYS_arch_prctl,
        libc::SYS_pkey_alloc,
        libc::SYS_pkey_mprotect,
        libc::SYS_pkey_free,
    ]);

    syscalls
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn install() -> sandcell_common::Result<()> {
    tracing::warn!("syscall filtering is only supported on linux; the worker runs unconfined");
    Ok(())
}
