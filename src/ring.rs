//! The ring coordinator: submission-queue preparation paired with
//! completion-queue reaping.
//!
//! Preparing an operation claims a slot in the [`SlotTable`], writes the
//! slot id into the SQE's `user_data` and leaves the entry in the
//! submission queue; nothing reaches the kernel until [`Ring::submit`].
//! Reaping reads the id back off the CQE, releases the slot and returns the
//! caller's token with the kernel's result. The slot table and the
//! submission queue are independently bounded, so preparation is two-phase:
//! claim a slot, then try for an SQE, and give the slot back if the queue
//! has no room.

use crate::addr::SockAddr;
use crate::errors::RingError;
use crate::slots::{SlotId, SlotTable};
use crate::types::Access;
use io_uring::types::{self, SubmitArgs, Timespec};
use io_uring::{opcode, squeue, IoUring};
use nix::fcntl::{OFlag, ResolveFlag};
use nix::poll::PollFlags;
use nix::sys::socket::SockFlag;
use nix::sys::stat::Mode;
use std::cell::RefCell;
use std::ffi::CString;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use std::{io, mem};
use tracing::{trace, warn};

/// Default length of the registered fixed buffer.
pub const DEFAULT_FIXED_BUFFER_LEN: usize = 1 << 20;

// Index of the single registered buffer; fixed-mode SQEs name it explicitly.
const FIXED_BUF_INDEX: u16 = 0;

const RING_CLOSED: &str = "ring already shut down";

/// One reaped completion: the caller's token plus the kernel's signed
/// result (`>= 0` on success, `-errno` on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion<T> {
    pub token: T,
    pub result: i32,
}

/// Handle to one in-flight operation, returned on successful preparation.
/// Needed to [`Ring::cancel`] the operation; kept valid until its
/// completion is reaped, after which it is rejected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Job(SlotId);

impl Job {
    /// The slot id carried through the kernel for this operation.
    pub fn slot(self) -> SlotId {
        self.0
    }
}

/// Memory the kernel keeps reading (or writing) for the lifetime of one
/// operation. Stored in the slot so it is released exactly when the
/// completion is reaped.
#[allow(dead_code)] // held for its Drop, never read back
enum Aux {
    None,
    OpenHow(Box<OpenHowData>),
    Connect(Box<SockAddr>),
    Accept(Rc<RefCell<SockAddr>>),
}

// The open_how block and the NUL-terminated path the SQE points at. Boxed
// so the addresses survive the move into the slot table.
struct OpenHowData {
    how: types::OpenHow,
    path: CString,
}

struct Flight<T> {
    token: T,
    #[allow(dead_code)] // owns kernel-referenced memory until the CQE lands
    aux: Aux,
}

/// Configuration for a [`Ring`].
pub struct Builder {
    queue_depth: usize,
    fixed_buffer_len: usize,
}

impl Builder {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            fixed_buffer_len: DEFAULT_FIXED_BUFFER_LEN,
        }
    }

    /// Length of the fixed buffer registered for `read_fixed`/`write_fixed`.
    /// Defaults to 1 MiB; zero skips registration entirely.
    pub fn fixed_buffer_len(mut self, len: usize) -> Self {
        self.fixed_buffer_len = len;
        self
    }

    pub fn build<T>(&self) -> Result<Ring<T>, RingError> {
        let depth = u32::try_from(self.queue_depth)
            .ok()
            .filter(|&d| d > 0)
            .ok_or(RingError::InvalidQueueDepth)?;

        let ring = IoUring::new(depth).map_err(|e| RingError::sys("io_uring_setup", e))?;

        let mut fixed = vec![0u8; self.fixed_buffer_len].into_boxed_slice();
        let buf_registered = register_fixed(&ring, &mut fixed)?;

        Ok(Ring {
            ring: Some(ring),
            slots: SlotTable::new(self.queue_depth),
            fixed,
            buf_registered,
            dirty: false,
            queue_depth: self.queue_depth,
        })
    }
}

fn register_fixed(ring: &IoUring, buf: &mut [u8]) -> Result<bool, RingError> {
    if buf.is_empty() {
        return Ok(false);
    }

    let iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    // SAFETY: the buffer is owned by the ring and stays mapped until it is
    // unregistered (realloc_buffer or teardown).
    unsafe { ring.submitter().register_buffers(&[iov]) }
        .map_err(|e| RingError::sys("io_uring_register_buffers", e))?;

    Ok(true)
}

/// A single-owner io_uring instance with slot-tracked submissions.
///
/// `T` is the caller's completion token, handed back verbatim by
/// [`peek`](Self::peek)/[`wait`](Self::wait). At most `queue_depth`
/// operations are in flight at once; preparation methods return `None` when
/// either the slot table or the submission queue is full, and the caller
/// reaps a completion before retrying.
///
/// Not internally synchronized: one logical owner drives all calls.
pub struct Ring<T> {
    // None once `exit` has run.
    ring: Option<IoUring>,
    slots: SlotTable<Flight<T>>,
    fixed: Box<[u8]>,
    buf_registered: bool,
    // At least one prepared SQE has not been handed to the kernel.
    dirty: bool,
    queue_depth: usize,
}

impl<T> Ring<T> {
    /// A ring with room for `queue_depth` concurrent operations and the
    /// default 1 MiB fixed buffer.
    pub fn new(queue_depth: usize) -> Result<Self, RingError> {
        Builder::new(queue_depth).build()
    }

    pub fn builder(queue_depth: usize) -> Builder {
        Builder::new(queue_depth)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Number of operations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// The registered fixed buffer. `read_fixed` completions land here.
    pub fn buf(&self) -> &[u8] {
        &self.fixed
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.fixed
    }

    /// Replaces the registered fixed buffer, returning the old one.
    ///
    /// The caller must ensure no fixed-mode operation is in flight; this is
    /// not tracked here and re-registering under an active fixed read or
    /// write is undefined at the kernel's discretion.
    pub fn realloc_buffer(&mut self, buf: Box<[u8]>) -> Result<Box<[u8]>, RingError> {
        let ring = self.ring.as_ref().expect(RING_CLOSED);

        if self.buf_registered {
            ring.submitter()
                .unregister_buffers()
                .map_err(|e| RingError::sys("io_uring_unregister_buffers", e))?;
            self.buf_registered = false;
        }

        let old = mem::replace(&mut self.fixed, buf);
        self.buf_registered = register_fixed(ring, &mut self.fixed)?;
        trace!(len = self.fixed.len(), "fixed buffer swapped");

        Ok(old)
    }

    /// Hands every prepared entry to the kernel, returning how many it
    /// accepted. A no-op returning 0 when nothing is prepared.
    pub fn submit(&mut self) -> Result<usize, RingError> {
        if !self.dirty {
            return Ok(0);
        }
        self.dirty = false;

        let ring = self.ring.as_mut().expect(RING_CLOSED);
        ring.submission().sync();
        let submitted = ring
            .submit()
            .map_err(|e| RingError::sys("io_uring_enter", e))?;

        trace!(submitted, "submission queue drained");
        Ok(submitted)
    }

    /// Non-blocking reap of one completion.
    pub fn peek(&mut self) -> Result<Option<Completion<T>>, RingError> {
        Ok(self.reap())
    }

    /// Reaps one completion, blocking until one is available (no timeout)
    /// or for at most `timeout`. Returns `None` when interrupted, when
    /// nothing is ready, or when the timeout expires.
    ///
    /// Entries prepared but not yet [`submit`](Self::submit)ted are *not*
    /// flushed by waiting; a ring with nothing submitted and no timeout
    /// blocks until a signal arrives.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Completion<T>>, RingError> {
        if let Some(done) = self.reap() {
            return Ok(Some(done));
        }

        let waited = {
            let ring = self.ring.as_ref().expect(RING_CLOSED);
            match timeout {
                Some(timeout) => {
                    let ts = Timespec::from(timeout);
                    let args = SubmitArgs::new().timespec(&ts);
                    ring.submitter().submit_with_args(1, &args)
                }
                None => ring.submitter().submit_and_wait(1),
            }
        };

        match waited {
            Ok(_) => Ok(self.reap()),
            Err(err) if is_transient(&err) => Ok(None),
            Err(err) => Err(RingError::sys("io_uring_enter", err)),
        }
    }

    /// Tears down the kernel ring and drops the fixed-buffer registration.
    /// Idempotent; also run on drop. Operations still in flight never
    /// deliver their completions, and their tokens and auxiliary memory are
    /// dropped with the slot table.
    pub fn exit(&mut self) {
        if let Some(ring) = self.ring.take() {
            if self.buf_registered {
                if let Err(err) = ring.submitter().unregister_buffers() {
                    warn!(%err, "failed to unregister fixed buffer");
                }
                self.buf_registered = false;
            }
            trace!("ring shut down");
        }
    }

    fn reap(&mut self) -> Option<Completion<T>> {
        loop {
            let cqe = self.ring.as_mut().expect(RING_CLOSED).completion().next()?;
            let id = SlotId::from_raw(cqe.user_data());

            match self.slots.remove(id) {
                Ok(flight) => {
                    return Some(Completion {
                        token: flight.token,
                        result: cqe.result(),
                    });
                }
                Err(_) => {
                    // A CQE we have no record of; nothing to hand back.
                    warn!(
                        user_data = cqe.user_data(),
                        result = cqe.result(),
                        "completion for unknown slot, dropped"
                    );
                }
            }
        }
    }

    // Claim a slot, tag the entry with its id and queue it. Rolls the slot
    // back if the submission queue is out of room so that live slots always
    // match prepared-or-submitted operations one to one.
    fn enqueue(&mut self, token: T, aux: Aux, entry: squeue::Entry) -> Option<Job> {
        let id = self.slots.insert(Flight { token, aux }).ok()?;
        let entry = entry.user_data(id.as_raw());

        let pushed = {
            let ring = self.ring.as_mut().expect(RING_CLOSED);
            // SAFETY: every pointer in the entry targets either the
            // ring-owned fixed buffer, slot-owned auxiliary memory, or
            // caller memory whose validity the unsafe vectored ops contract
            // for; all outlive the operation.
            unsafe { ring.submission().push(&entry) }
        };

        if pushed.is_err() {
            let _ = self.slots.remove(id);
            return None;
        }

        self.dirty = true;
        Some(Job(id))
    }
}

/// Operation preparation. Each method queues one SQE tagged with a fresh
/// slot id and returns its [`Job`], or `None` under back-pressure.
impl<T> Ring<T> {
    /// No-op completing with result 0. Useful for wake-ups and plumbing.
    pub fn noop(&mut self, token: T) -> Option<Job> {
        self.enqueue(token, Aux::None, opcode::Nop::new().build())
    }

    /// Opens `path` relative to `dir_fd` (current directory when `None`)
    /// with `openat2` semantics. The final open flags are
    /// `flags | access`; `resolve` constrains path resolution. The path is
    /// copied, so the borrow ends at return.
    ///
    /// Completes with the new descriptor, or `-errno`.
    #[allow(clippy::too_many_arguments)]
    pub fn openat2(
        &mut self,
        access: Access,
        flags: OFlag,
        mode: Mode,
        resolve: ResolveFlag,
        dir_fd: Option<RawFd>,
        path: &Path,
        token: T,
    ) -> Result<Option<Job>, RingError> {
        let path = CString::new(path.as_os_str().as_bytes())?;
        let how = types::OpenHow::new()
            .flags((flags | access.open_flags()).bits() as u64)
            .mode(u64::from(mode.bits()))
            .resolve(resolve.bits());

        let data = Box::new(OpenHowData { how, path });
        let entry = opcode::OpenAt2::new(
            types::Fd(dir_fd.unwrap_or(libc::AT_FDCWD)),
            data.path.as_ptr(),
            std::ptr::from_ref(&data.how),
        )
        .build();

        Ok(self.enqueue(token, Aux::OpenHow(data), entry))
    }

    /// Closes `fd`.
    pub fn close(&mut self, fd: RawFd, token: T) -> Option<Job> {
        self.enqueue(token, Aux::None, opcode::Close::new(types::Fd(fd)).build())
    }

    /// Reads up to `len` bytes from `fd` at `file_offset` into the
    /// registered fixed buffer at `buf_offset`.
    ///
    /// # Panics
    ///
    /// If `buf_offset + len` exceeds the fixed buffer.
    pub fn read_fixed(
        &mut self,
        fd: RawFd,
        buf_offset: usize,
        len: usize,
        file_offset: u64,
        token: T,
    ) -> Option<Job> {
        let ptr = self.fixed_range(buf_offset, len);
        let entry = opcode::ReadFixed::new(types::Fd(fd), ptr, len as u32, FIXED_BUF_INDEX)
            .offset(file_offset)
            .build();
        self.enqueue(token, Aux::None, entry)
    }

    /// Writes `len` bytes from the registered fixed buffer at `buf_offset`
    /// to `fd` at `file_offset`.
    ///
    /// # Panics
    ///
    /// If `buf_offset + len` exceeds the fixed buffer.
    pub fn write_fixed(
        &mut self,
        fd: RawFd,
        buf_offset: usize,
        len: usize,
        file_offset: u64,
        token: T,
    ) -> Option<Job> {
        let ptr = self.fixed_range(buf_offset, len);
        let entry = opcode::WriteFixed::new(types::Fd(fd), ptr, len as u32, FIXED_BUF_INDEX)
            .offset(file_offset)
            .build();
        self.enqueue(token, Aux::None, entry)
    }

    /// Scatter-read into caller-owned buffers at `file_offset`.
    ///
    /// # Safety
    ///
    /// The kernel holds the iovec array and the buffers it points at until
    /// the completion is reaped; the caller must keep `bufs` and its
    /// targets alive and unmoved until then.
    pub unsafe fn readv(
        &mut self,
        fd: RawFd,
        bufs: &mut [IoSliceMut<'_>],
        file_offset: u64,
        token: T,
    ) -> Option<Job> {
        // IoSliceMut is guaranteed ABI-compatible with iovec.
        let entry = opcode::Readv::new(
            types::Fd(fd),
            bufs.as_mut_ptr() as *const libc::iovec,
            bufs.len() as u32,
        )
        .offset(file_offset)
        .build();
        self.enqueue(token, Aux::None, entry)
    }

    /// Gather-write from caller-owned buffers at `file_offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`readv`](Self::readv): `bufs` and its targets must
    /// stay valid until the completion is reaped.
    pub unsafe fn writev(
        &mut self,
        fd: RawFd,
        bufs: &[IoSlice<'_>],
        file_offset: u64,
        token: T,
    ) -> Option<Job> {
        let entry = opcode::Writev::new(
            types::Fd(fd),
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as u32,
        )
        .offset(file_offset)
        .build();
        self.enqueue(token, Aux::None, entry)
    }

    /// Single-shot readiness notification for `fd`. Completes with the
    /// ready event mask.
    pub fn poll_add(&mut self, fd: RawFd, events: PollFlags, token: T) -> Option<Job> {
        let entry = opcode::PollAdd::new(types::Fd(fd), events.bits() as u32).build();
        self.enqueue(token, Aux::None, entry)
    }

    /// Kernel-side copy of up to `len` bytes from `fd_in` to `fd_out`, both
    /// at their current positions (at least one end must be a pipe).
    pub fn splice(&mut self, fd_in: RawFd, fd_out: RawFd, len: usize, token: T) -> Option<Job> {
        let entry =
            opcode::Splice::new(types::Fd(fd_in), -1, types::Fd(fd_out), -1, len as u32).build();
        self.enqueue(token, Aux::None, entry)
    }

    /// Connects `fd` to `addr`. The address is stored with the operation,
    /// so the kernel reads it for as long as it needs to.
    pub fn connect(&mut self, fd: RawFd, addr: SockAddr, token: T) -> Option<Job> {
        let addr = Box::new(addr);
        let entry =
            opcode::Connect::new(types::Fd(fd), addr.as_sockaddr_ptr(), addr.len()).build();
        self.enqueue(token, Aux::Connect(addr), entry)
    }

    /// Accepts one connection on listening socket `fd`, close-on-exec. The
    /// peer's address is written into `addr`, which the slot keeps alive;
    /// read it from your clone after reaping the completion.
    ///
    /// Completes with the accepted descriptor, or `-errno`.
    pub fn accept(&mut self, fd: RawFd, addr: Rc<RefCell<SockAddr>>, token: T) -> Option<Job> {
        addr.borrow_mut().reset_for_accept();

        // Raw pointers into the shared cell; no borrow is held while the
        // kernel writes.
        let raw = addr.as_ptr();
        let entry = unsafe {
            opcode::Accept::new(
                types::Fd(fd),
                (*raw).as_sockaddr_mut_ptr(),
                (*raw).len_mut_ptr(),
            )
        }
        .flags(SockFlag::SOCK_CLOEXEC.bits())
        .build();

        self.enqueue(token, Aux::Accept(addr), entry)
    }

    /// Requests cancellation of `target`. A stale handle, one whose
    /// completion was already reaped, is rejected here with
    /// [`RingError::StaleJob`] and never reaches the kernel.
    ///
    /// Three outcomes, depending on how far the target got: target
    /// `-ECANCELED` with cancel `0`; target `-EINTR` with cancel
    /// `-EALREADY`; or the target's natural result with cancel `-ENOENT`.
    pub fn cancel(&mut self, target: Job, token: T) -> Result<Option<Job>, RingError> {
        if !self.slots.contains(target.0) {
            return Err(RingError::StaleJob);
        }

        let entry = opcode::AsyncCancel::new(target.0.as_raw()).build();
        Ok(self.enqueue(token, Aux::None, entry))
    }

    #[track_caller]
    fn fixed_range(&mut self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset
                .checked_add(len)
                .is_some_and(|end| end <= self.fixed.len()),
            "range {offset}+{len} exceeds the {}-byte fixed buffer",
            self.fixed.len()
        );
        // SAFETY: in bounds per the assert above.
        unsafe { self.fixed.as_mut_ptr().add(offset) }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        self.exit();
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR | libc::EAGAIN | libc::ETIME)
    )
}
