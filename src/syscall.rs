//! Raw syscall dispatch at the native machine word width.
//!
//! Four entry points, mirroring the shape the hosting runtime expects:
//! blocking/raw × 3/6 arguments. The blocking variants bracket the kernel
//! transition with scheduler notifications so a parked OS thread during a
//! slow call does not starve other ready tasks; the raw variants skip the
//! notifications and are reserved for calls known not to block, or contexts
//! where the scheduler must not be touched (signal handling, pre-init).

use core::ffi::c_int;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        unsafe fn errno_slot() -> *mut c_int {
            libc::__errno_location()
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        unsafe fn errno_slot() -> *mut c_int {
            libc::__error()
        }
    } else {
        compile_error!("no errno slot accessor for this target");
    }
}

/// Word width used to encode syscall arguments.
///
/// Fixed per architecture at build time; truncating a 64-bit argument on a
/// narrower platform (or widening one incorrectly) corrupts syscall
/// semantics, so the encoding must be exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    W32,
    W64,
}

impl WordWidth {
    /// The width of this build's machine word.
    pub const NATIVE: WordWidth = if cfg!(target_pointer_width = "64") {
        WordWidth::W64
    } else {
        WordWidth::W32
    };

    fn encode(self, value: usize) -> u64 {
        match self {
            // The 32-bit ABI takes signed words; routing through i32 keeps
            // the bit pattern the kernel expects for negative values.
            WordWidth::W32 => i64::from(value as u32 as i32) as u64,
            WordWidth::W64 => value as u64,
        }
    }

    fn decode(self, word: u64) -> usize {
        match self {
            WordWidth::W32 => (word as u32 as i32) as isize as usize,
            WordWidth::W64 => word as usize,
        }
    }
}

/// The platform capability consumed by [`SyscallInvoker`]: the kernel
/// trampoline, the per-thread error slot, and the scheduler hooks.
///
/// [`LibcHost`] implements it for a standalone process; a hosting runtime
/// supplies its own implementation with the scheduler hooks wired up.
pub trait SyscallHost {
    /// Issues the kernel transition with arguments already encoded at
    /// `width` and returns the raw result word.
    ///
    /// # Safety
    ///
    /// Executes an arbitrary syscall; the caller is responsible for the
    /// number and arguments being valid for this platform.
    unsafe fn trampoline(&self, width: WordWidth, nr: u64, args: [u64; 6]) -> u64;

    /// Reads the calling thread's error slot.
    fn last_errno(&self) -> i32;

    /// The calling task is about to block on a kernel transition.
    fn enter_blocking_syscall(&self);

    /// The calling task resumed normal execution.
    fn exit_blocking_syscall(&self);
}

/// [`SyscallHost`] backed by `libc::syscall`.
///
/// The scheduler hooks are no-ops: a plain process has no cooperative
/// scheduler to notify.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHost;

impl SyscallHost for LibcHost {
    unsafe fn trampoline(&self, _width: WordWidth, nr: u64, args: [u64; 6]) -> u64 {
        // `libc::syscall` is native-width by construction, so the width
        // the invoker encoded at is already the one in effect here.
        //
        // The slot is cleared first: the kernel only writes it on failure,
        // and the invoker reads it unconditionally afterwards.
        *errno_slot() = 0;
        let ret = libc::syscall(
            nr as libc::c_long,
            args[0] as libc::c_long,
            args[1] as libc::c_long,
            args[2] as libc::c_long,
            args[3] as libc::c_long,
            args[4] as libc::c_long,
            args[5] as libc::c_long,
        );
        ret as u64
    }

    fn last_errno(&self) -> i32 {
        unsafe { *errno_slot() }
    }

    fn enter_blocking_syscall(&self) {}

    fn exit_blocking_syscall(&self) {}
}

/// Issues raw syscalls through an injected [`SyscallHost`].
///
/// Stateless apart from the host handle; safe to share and call from any
/// number of threads concurrently.
pub struct SyscallInvoker<H> {
    host: H,
    width: WordWidth,
}

impl<H: SyscallHost> SyscallInvoker<H> {
    pub fn new(host: H) -> Self {
        Self::with_width(host, WordWidth::NATIVE)
    }

    // Only tests ever pin a non-native width; the public constructor keeps
    // the compile-time choice.
    fn with_width(host: H, width: WordWidth) -> Self {
        Self { host, width }
    }

    /// A 3-argument syscall that may block, bracketed by scheduler
    /// notifications. Returns `(r1, r2, errno)`; `errno` of zero means the
    /// result words are meaningful. `r2` is always zero on this ABI.
    ///
    /// # Safety
    ///
    /// Executes an arbitrary syscall; the caller is responsible for the
    /// number and arguments being valid for this platform.
    pub unsafe fn syscall(&self, nr: usize, a1: usize, a2: usize, a3: usize) -> (usize, usize, i32) {
        self.host.enter_blocking_syscall();
        let r1 = self.invoke(nr, [a1, a2, a3, 0, 0, 0]);
        // errno belongs to the syscall just issued; read it before the
        // scheduler gets a chance to run anything else on this thread.
        let errno = self.host.last_errno();
        self.host.exit_blocking_syscall();
        (r1, 0, errno)
    }

    /// The 6-argument form of [`syscall`](SyscallInvoker::syscall).
    ///
    /// # Safety
    ///
    /// See [`syscall`](SyscallInvoker::syscall).
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn syscall6(
        &self,
        nr: usize,
        a1: usize,
        a2: usize,
        a3: usize,
        a4: usize,
        a5: usize,
        a6: usize,
    ) -> (usize, usize, i32) {
        self.host.enter_blocking_syscall();
        let r1 = self.invoke(nr, [a1, a2, a3, a4, a5, a6]);
        let errno = self.host.last_errno();
        self.host.exit_blocking_syscall();
        (r1, 0, errno)
    }

    /// A 3-argument syscall with no scheduler notifications.
    ///
    /// # Safety
    ///
    /// See [`syscall`](SyscallInvoker::syscall). Additionally the call must
    /// be known not to block, or be made in a context where the scheduler
    /// must not be disturbed.
    pub unsafe fn raw_syscall(
        &self,
        nr: usize,
        a1: usize,
        a2: usize,
        a3: usize,
    ) -> (usize, usize, i32) {
        let r1 = self.invoke(nr, [a1, a2, a3, 0, 0, 0]);
        (r1, 0, self.host.last_errno())
    }

    /// The 6-argument form of [`raw_syscall`](SyscallInvoker::raw_syscall).
    ///
    /// # Safety
    ///
    /// See [`raw_syscall`](SyscallInvoker::raw_syscall).
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn raw_syscall6(
        &self,
        nr: usize,
        a1: usize,
        a2: usize,
        a3: usize,
        a4: usize,
        a5: usize,
        a6: usize,
    ) -> (usize, usize, i32) {
        let r1 = self.invoke(nr, [a1, a2, a3, a4, a5, a6]);
        (r1, 0, self.host.last_errno())
    }

    unsafe fn invoke(&self, nr: usize, args: [usize; 6]) -> usize {
        let w = self.width;
        let ret = self.host.trampoline(w, w.encode(nr), args.map(|a| w.encode(a)));
        w.decode(ret)
    }
}

/// [`SyscallInvoker::syscall`] over [`LibcHost`].
///
/// # Safety
///
/// See [`SyscallInvoker::syscall`].
pub unsafe fn syscall(nr: usize, a1: usize, a2: usize, a3: usize) -> (usize, usize, i32) {
    SyscallInvoker::new(LibcHost).syscall(nr, a1, a2, a3)
}

/// [`SyscallInvoker::syscall6`] over [`LibcHost`].
///
/// # Safety
///
/// See [`SyscallInvoker::syscall`].
pub unsafe fn syscall6(
    nr: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> (usize, usize, i32) {
    SyscallInvoker::new(LibcHost).syscall6(nr, a1, a2, a3, a4, a5, a6)
}

/// [`SyscallInvoker::raw_syscall`] over [`LibcHost`].
///
/// # Safety
///
/// See [`SyscallInvoker::raw_syscall`].
pub unsafe fn raw_syscall(nr: usize, a1: usize, a2: usize, a3: usize) -> (usize, usize, i32) {
    SyscallInvoker::new(LibcHost).raw_syscall(nr, a1, a2, a3)
}

/// [`SyscallInvoker::raw_syscall6`] over [`LibcHost`].
///
/// # Safety
///
/// See [`SyscallInvoker::raw_syscall`].
pub unsafe fn raw_syscall6(
    nr: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> (usize, usize, i32) {
    SyscallInvoker::new(LibcHost).raw_syscall6(nr, a1, a2, a3, a4, a5, a6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Enter,
        Trampoline {
            width: WordWidth,
            nr: u64,
            args: [u64; 6],
        },
        ErrnoRead,
        Exit,
    }

    #[derive(Default)]
    struct RecordingHost {
        events: RefCell<Vec<Event>>,
        ret: Cell<u64>,
        errno: Cell<i32>,
    }

    impl SyscallHost for RecordingHost {
        unsafe fn trampoline(&self, width: WordWidth, nr: u64, args: [u64; 6]) -> u64 {
            self.events
                .borrow_mut()
                .push(Event::Trampoline { width, nr, args });
            self.ret.get()
        }

        fn last_errno(&self) -> i32 {
            self.events.borrow_mut().push(Event::ErrnoRead);
            self.errno.get()
        }

        fn enter_blocking_syscall(&self) {
            self.events.borrow_mut().push(Event::Enter);
        }

        fn exit_blocking_syscall(&self) {
            self.events.borrow_mut().push(Event::Exit);
        }
    }

    fn shape_of(events: &[Event]) -> Vec<&'static str> {
        events
            .iter()
            .map(|event| match event {
                Event::Enter => "enter",
                Event::Trampoline { .. } => "trampoline",
                Event::ErrnoRead => "errno",
                Event::Exit => "exit",
            })
            .collect()
    }

    #[test]
    fn blocking_variants_bracket_the_trampoline() {
        let invoker = SyscallInvoker::new(RecordingHost::default());

        unsafe { invoker.syscall(1, 2, 3, 4) };
        assert_eq!(
            shape_of(&invoker.host.events.borrow()),
            ["enter", "trampoline", "errno", "exit"]
        );

        invoker.host.events.borrow_mut().clear();
        unsafe { invoker.syscall6(1, 2, 3, 4, 5, 6, 7) };
        assert_eq!(
            shape_of(&invoker.host.events.borrow()),
            ["enter", "trampoline", "errno", "exit"]
        );
    }

    #[test]
    fn raw_variants_skip_the_notifications() {
        let invoker = SyscallInvoker::new(RecordingHost::default());

        unsafe { invoker.raw_syscall(1, 2, 3, 4) };
        assert_eq!(
            shape_of(&invoker.host.events.borrow()),
            ["trampoline", "errno"]
        );

        invoker.host.events.borrow_mut().clear();
        unsafe { invoker.raw_syscall6(1, 2, 3, 4, 5, 6, 7) };
        assert_eq!(
            shape_of(&invoker.host.events.borrow()),
            ["trampoline", "errno"]
        );
    }

    #[test]
    fn exit_notification_fires_even_on_error() {
        let invoker = SyscallInvoker::new(RecordingHost::default());
        invoker.host.errno.set(9);

        let (_, _, errno) = unsafe { invoker.syscall(1, 0, 0, 0) };
        assert_eq!(errno, 9);
        assert_eq!(
            shape_of(&invoker.host.events.borrow()),
            ["enter", "trampoline", "errno", "exit"]
        );
    }

    #[test]
    fn six_arguments_pass_through_in_order() {
        let invoker = SyscallInvoker::with_width(RecordingHost::default(), WordWidth::W64);

        unsafe { invoker.syscall6(99, 1, 2, 3, 4, 5, 6) };
        let events = invoker.host.events.borrow();
        assert_eq!(
            events[1],
            Event::Trampoline {
                width: WordWidth::W64,
                nr: 99,
                args: [1, 2, 3, 4, 5, 6],
            }
        );
    }

    #[test]
    fn three_argument_form_zeroes_the_rest() {
        let invoker = SyscallInvoker::with_width(RecordingHost::default(), WordWidth::W64);

        unsafe { invoker.syscall(99, 1, 2, 3) };
        let events = invoker.host.events.borrow();
        assert_eq!(
            events[1],
            Event::Trampoline {
                width: WordWidth::W64,
                nr: 99,
                args: [1, 2, 3, 0, 0, 0],
            }
        );
    }

    #[test]
    fn result_word_and_errno_come_back_unchanged() {
        let invoker = SyscallInvoker::with_width(RecordingHost::default(), WordWidth::W64);
        invoker.host.ret.set(42);

        let (r1, r2, errno) = unsafe { invoker.syscall(1, 0, 0, 0) };
        assert_eq!((r1, r2, errno), (42, 0, 0));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn wide_words_survive_the_64_bit_encoding() {
        let invoker = SyscallInvoker::with_width(RecordingHost::default(), WordWidth::W64);

        unsafe { invoker.syscall(1, 0x7FFF_FFFF, 0x8000_0000, 0x1234_5678_9ABC_DEF0) };
        let events = invoker.host.events.borrow();
        let Event::Trampoline { args, .. } = &events[1] else {
            panic!("expected a trampoline event");
        };
        assert_eq!(args[0], 0x7FFF_FFFF);
        assert_eq!(args[1], 0x8000_0000);
        assert_eq!(args[2], 0x1234_5678_9ABC_DEF0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn narrow_encoding_is_exact_up_to_the_sign_boundary() {
        let invoker = SyscallInvoker::with_width(RecordingHost::default(), WordWidth::W32);

        unsafe { invoker.syscall(1, 0x7FFF_FFFF, 0x8000_0000, 0) };
        let events = invoker.host.events.borrow();
        let Event::Trampoline { width, args, .. } = &events[1] else {
            panic!("expected a trampoline event");
        };
        assert_eq!(*width, WordWidth::W32);
        // 2^31 - 1 fits a signed 32-bit word and must arrive unchanged.
        assert_eq!(args[0], 0x7FFF_FFFF);
        // 2^31 does not; the signed encoding makes the difference visible
        // to the trampoline instead of silently dropping bits.
        assert_eq!(args[1], 0xFFFF_FFFF_8000_0000);
        assert_ne!(args[1], 0x8000_0000);
    }

    #[test]
    fn narrow_results_are_sign_extended() {
        let invoker = SyscallInvoker::with_width(RecordingHost::default(), WordWidth::W32);
        // A 32-bit kernel returning -1 presents as all-ones in the low word.
        invoker.host.ret.set(0xFFFF_FFFF);

        let (r1, _, _) = unsafe { invoker.raw_syscall(1, 0, 0, 0) };
        assert_eq!(r1, usize::MAX);
    }
}
