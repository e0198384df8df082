//! A thin boundary between a managed-runtime process and the host OS:
//! raw syscall dispatch that cooperates with a task scheduler, and a
//! mapping registry that guarantees every unmap targets a range actually
//! returned by a prior map, in full, exactly once.

mod errors;
mod mmap;
mod syscall;

pub use errors::Error;
pub type Result<T> = core::result::Result<T, Error>;

pub use mmap::{mapper, mmap, munmap, HostMem, MappingRegistry, MappingView, RawMem};
pub use syscall::{
    raw_syscall, raw_syscall6, syscall, syscall6, LibcHost, SyscallHost, SyscallInvoker, WordWidth,
};

// Protection and mapping flags pass through to the OS unchanged; re-exported
// so callers don't need to name rustix themselves.
pub use rustix::fd::RawFd;
pub use rustix::mm::{MapFlags, ProtFlags};

/// The standard descriptors every process starts with.
pub const STDIN: RawFd = 0;
pub const STDOUT: RawFd = 1;
pub const STDERR: RawFd = 2;

pub fn host_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).try_into().unwrap() }
}
