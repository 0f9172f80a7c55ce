// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the process abstraction: PID, saved register state, a
//! private address space, a local file descriptor map, and the
//! fork/exec/launch/resume/brk lifecycle that drives them, grounded
//! on `Process.cpp`/`.h` from the original `stable_genius` kernel.
//!
//! Unlike the teacher's 64-bit `multitasking::thread` crate, which
//! schedules independent threads sharing a capability-style process,
//! the unit of scheduling here is the process itself: there is no
//! separate thread abstraction, and `fork`/`exec` (rather than thread
//! spawn) are the only ways a new `Process` comes into being.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod elf;
mod table;

pub use table::{with_table, Table, PROCESSES};

use align::align_up_u32;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use elf::ElfImage;
use filesystem::file_table::{self, FileKey};
use memlayout::{KERNEL_VIRTUAL_BASE, MAX_USER_STACK, PAGE_SIZE, USER_STACK_TOP};
use virtmem::{Flags, Pdt};

core::arch::global_asm!(include_str!("launch.s"));

extern "C" {
    fn launch_process(
        edi: u32,
        esi: u32,
        ebp: u32,
        esp_fake: u32,
        ebx: u32,
        edx: u32,
        ecx: u32,
        eax: u32,
        eip: u32,
        cs: u32,
        eflags: u32,
        esp: u32,
        ss: u32,
    ) -> !;

    fn launch_kernel_process(
        edi: u32,
        esi: u32,
        ebp: u32,
        esp_fake: u32,
        ebx: u32,
        edx: u32,
        ecx: u32,
        eax: u32,
        eip: u32,
        cs: u32,
        eflags: u32,
    ) -> !;

    fn get_eflags() -> u32;
}

/// A process identifier. PID 0 is never assigned to a process;
/// [`Table::allocate`] starts counting from 1.
///
pub type Pid = u32;

/// The segment selectors `launch`/`resume` build an `iret` frame with.
///
/// These match the GDT layout `gdt`-style kernels conventionally use:
/// kernel code/data at ring 0, user code/data at ring 3, with the
/// user selectors' low two bits (the requested privilege level) set.
///
pub struct Selectors {
    pub kernel_cs: u32,
    pub kernel_ss: u32,
    pub user_cs: u32,
    pub user_ss: u32,
}

/// Describes why a process operation could not be completed.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Physical memory, or a virtual mapping, could not be obtained.
    ///
    Paging(virtmem::Error),

    /// The ELF image failed validation.
    ///
    BadBinary(elf::Error),

    /// A `brk` request asked for an address below the ELF-computed
    /// break point.
    ///
    BreakBelowImage,

    /// A `brk` or `set_user_stack` request would make the break point
    /// and the user stack overlap.
    ///
    StackCollision,

    /// A `set_user_stack` request exceeded [`MAX_USER_STACK`].
    ///
    StackTooLarge,
}

impl From<virtmem::Error> for Error {
    fn from(e: virtmem::Error) -> Self {
        Error::Paging(e)
    }
}

/// A process's place in the scheduler's state machine.
///
/// ```text
///           new            launch
/// (invalid)→sleeping/runnable→active
///               ↑                 ↓ timer/syscall-block
///               └─────sleeping ←──┘
///             exit      ↓
///               zombie  ←  (any state)
/// ```
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Not yet a live process: the default before `new`/`fork_duplicate`
    /// finish building one, and briefly during `exec_duplicate`.
    ///
    Invalid,

    /// Constructed and runnable, but never yet given the CPU.
    ///
    Sleeping,

    /// Preempted or blocked; eligible to be resumed.
    ///
    Runnable,

    /// Currently the one process `resume`d into the CPU.
    ///
    Active,

    /// Exited; only PID relationships and the return value remain.
    ///
    Zombie,
}

/// The register state an `iret` restores, saved every time a process
/// is preempted.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct InterruptStack {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// The general-purpose registers saved alongside an [`InterruptStack`].
///
#[derive(Clone, Copy, Debug, Default)]
pub struct SavedRegisters {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// One process: its identity, address space, saved CPU state, and the
/// bookkeeping the scheduler and syscall layer need to drive its
/// lifecycle.
///
/// A `Process` owns its [`Pdt`] and kernel stack: both are freed when
/// the process is destroyed, never shared with another process.
///
pub struct Process {
    pub status: Status,

    /// Where execution resumes: the ELF entry point until the first
    /// `launch`, the last-saved `eip` afterwards.
    ///
    pub entry_point: u32,

    pdt: Option<Pdt>,

    /// Physical frame backing this process's kernel stack, or `None`
    /// before `launch`.
    ///
    kernel_stack_phys: Option<u32>,

    pub user_stack_top: u32,
    pub user_stack_size: u32,
    pub max_user_stack: u32,

    pub break_point: u32,
    elf_break_point: u32,

    pub interrupt_stack: InterruptStack,
    pub registers: SavedRegisters,

    elf: Option<ElfImage>,
    elf_data: Option<Vec<u8>>,

    /// Local fd → global file-table key.
    ///
    pub files: BTreeMap<u32, FileKey>,
    next_fd: u32,

    pub return_value: i32,
    pub parent: Pid,
    pub children: Vec<Pid>,

    /// Set whenever this process's user-space mappings fall out of
    /// sync with the currently-loaded PDT's, forcing `resume` to
    /// reload them even if `status` is already `Active`.
    ///
    pub pdt_changed: bool,
}

impl Default for Process {
    /// The "fork shell": an otherwise-empty process with a fresh empty
    /// PDT, no kernel stack yet, and every register zeroed. Used only
    /// as the basis [`fork_duplicate`](Process::fork_duplicate) fills
    /// in; never scheduled on its own.
    ///
    fn default() -> Self {
        Process {
            status: Status::Invalid,
            entry_point: 0,
            pdt: None,
            kernel_stack_phys: None,
            user_stack_top: USER_STACK_TOP,
            user_stack_size: 0,
            max_user_stack: MAX_USER_STACK,
            break_point: 0,
            elf_break_point: 0,
            interrupt_stack: InterruptStack::default(),
            registers: SavedRegisters::default(),
            elf: None,
            elf_data: None,
            files: BTreeMap::new(),
            next_fd: 0,
            return_value: 0,
            parent: 0,
            children: Vec::new(),
            pdt_changed: true,
        }
    }
}

impl Process {
    /// Reads and validates the ELF image at `path`, per spec.md §4.6,
    /// without yet allocating a PDT: status becomes `Sleeping`, and
    /// the remaining construction happens in [`launch`](Self::launch).
    ///
    pub fn new(path: &str) -> Result<Process, Error> {
        let mut file = filesystem::fopen(path, filesystem::OpenMode::Read)
            .map_err(|_| Error::BadBinary(elf::Error::Truncated))?;

        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(_) => return Err(Error::BadBinary(elf::Error::Truncated)),
            }
        }

        let image = ElfImage::parse(&data).map_err(Error::BadBinary)?;
        let elf_break_point = image.break_point(&data);

        let mut process = Process::default();
        process.status = Status::Sleeping;
        process.entry_point = image.entry_point;
        process.break_point = elf_break_point;
        process.elf_break_point = elf_break_point;
        process.elf = Some(image);
        process.elf_data = Some(data);
        Ok(process)
    }

    /// Builds a child of `parent`: an empty shell
    /// ([`default`](Self::default)) whose interrupt stack, registers,
    /// user-space mappings (deep-copied via
    /// [`Pdt::duplicate_user_space`]) and open file descriptors
    /// (ref-counted via [`file_table::copy`]) are all inherited from
    /// `parent`.
    ///
    /// The child's `eax` is forced to 0 so its view of `fork`'s return
    /// value is correct; its PPID is left at 0, to be filled in by the
    /// fork syscall once the child's PID has been allocated (a process
    /// does not know its own PID). Its child-PID vector starts empty:
    /// a fork's children are not inherited.
    ///
    pub fn fork_duplicate(parent: &Process) -> Result<Process, Error> {
        let mut child = Process::default();
        child.status = Status::Runnable;
        child.entry_point = parent.entry_point;
        child.interrupt_stack = parent.interrupt_stack;
        child.registers = parent.registers;
        child.registers.eax = 0;
        child.break_point = parent.break_point;
        child.elf_break_point = parent.elf_break_point;
        child.user_stack_top = parent.user_stack_top;
        child.user_stack_size = parent.user_stack_size;
        child.max_user_stack = parent.max_user_stack;

        let parent_pdt = parent.pdt.as_ref().expect("fork of a process with no PDT");
        child.pdt = Some(parent_pdt.duplicate_user_space()?);
        child.kernel_stack_phys = allocate_kernel_stack()?;

        for (&fd, &key) in &parent.files {
            file_table::copy(key).ok();
            child.files.insert(fd, key);
        }
        child.next_fd = parent.next_fd;

        Ok(child)
    }

    /// Transfers `other`'s file-descriptor map, parent PID and child
    /// PID list into a freshly-loaded process, used by `execve` to
    /// preserve the inheritance an exec must not disturb even though
    /// the address space and saved registers are entirely new.
    ///
    pub fn exec_duplicate(&mut self, other: Process) {
        self.files = other.files;
        self.next_fd = other.next_fd;
        self.parent = other.parent;
        self.children = other.children;
    }

    /// Opens `name` under `mode`, registering it in the global file
    /// table and returning the local fd that now addresses it.
    ///
    pub fn open_file(
        &mut self,
        name: &str,
        mode: filesystem::OpenMode,
    ) -> Result<u32, filesystem::Error> {
        let file = filesystem::fopen(name, mode)?;
        let key = file_table::open(name, file);
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, key);
        Ok(fd)
    }

    /// Closes the local fd `fd`, releasing its file-table reference.
    ///
    pub fn close_file(&mut self, fd: u32) -> bool {
        match self.files.remove(&fd) {
            Some(key) => {
                file_table::close(key).ok();
                true
            }
            None => false,
        }
    }

    /// First entry into user mode, per spec.md §4.7 "Launch":
    ///
    /// 1. Allocate every `PT_LOAD` page in `kernel_pdt` (the kernel's
    ///    own, currently-loaded directory), so the mapping operations
    ///    go through its recursive mapping rather than the process's
    ///    own not-yet-loaded one.
    /// 2. Allocate the initial user stack (one page immediately below
    ///    [`KERNEL_VIRTUAL_BASE`]) and kernel stack (one page).
    /// 3. Clone `kernel_pdt`, now carrying the process's user-space
    ///    pages, into a directory of its own, then clean those pages
    ///    back out of `kernel_pdt`, which must return to holding only
    ///    kernel-space mappings.
    /// 4. Build the `iret` frame: `eip` = entry point, `cs`/`ss` = the
    ///    user selectors, `eflags` = the caller's current flags, `esp`
    ///    = the top of the user stack.
    /// 5. Mark `Active` and hand off to the assembly trampoline. Never
    ///    returns: the calling context is gone once `iret` fires.
    ///
    /// `kernel_pdt` must be the directory currently loaded into CR3.
    ///
    pub fn launch(
        &mut self,
        kernel_pdt: &mut Pdt,
        selectors: &Selectors,
    ) -> Result<core::convert::Infallible, Error> {
        let elf = self.elf.as_ref().expect("launch of a process with no ELF image");
        let data = self.elf_data.as_ref().expect("launch of a process with no ELF data");

        elf.allocate(kernel_pdt)?;
        unsafe { elf.load(data) };

        let stack_page = align_up_u32(self.user_stack_top, PAGE_SIZE) - PAGE_SIZE;
        kernel_pdt.allocate(stack_page, Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESS, false)?;
        self.user_stack_size = PAGE_SIZE;

        self.kernel_stack_phys = allocate_kernel_stack()?;

        let pdt = kernel_pdt.duplicate_user_space()?;
        kernel_pdt.clean_user_space();
        self.pdt = Some(pdt);

        self.interrupt_stack = InterruptStack {
            eip: self.entry_point,
            cs: selectors.user_cs,
            eflags: unsafe { get_eflags() },
            esp: self.user_stack_top,
            ss: selectors.user_ss,
        };
        self.status = Status::Active;
        self.pdt_changed = false;

        self.pdt.as_ref().unwrap().load();

        let regs = self.registers;
        let stack = self.interrupt_stack;
        unsafe {
            launch_process(
                regs.edi, regs.esi, 0, 0, regs.ebx, regs.edx, regs.ecx, regs.eax,
                stack.eip, stack.cs, stack.eflags, stack.esp, stack.ss,
            )
        }
    }

    /// Returns from a later interrupt, per spec.md §4.7 "Resume":
    /// reload the user-space mappings iff we were not already active
    /// or [`pdt_changed`](Self::pdt_changed) is set, then hand off to
    /// whichever trampoline matches where execution was preempted.
    ///
    /// The caller is responsible for setting `TSS.esp0` to the top of
    /// this process's kernel stack before calling; that register lives
    /// outside this crate's scope.
    ///
    pub fn resume(&mut self, active_pdt: &mut Pdt, selectors: &Selectors) -> ! {
        let needs_reload = !matches!(self.status, Status::Active) || self.pdt_changed;
        if needs_reload {
            let pdt = self.pdt.as_ref().expect("resume of a process with no PDT");
            active_pdt.update_user_space(pdt);
            self.pdt_changed = false;
        }
        self.status = Status::Active;

        let regs = self.registers;
        let stack = self.interrupt_stack;
        if stack.eip >= KERNEL_VIRTUAL_BASE {
            unsafe {
                launch_kernel_process(
                    regs.edi, regs.esi, 0, 0, regs.ebx, regs.edx, regs.ecx, regs.eax,
                    stack.eip, selectors.kernel_cs, stack.eflags,
                )
            }
        } else {
            unsafe {
                launch_process(
                    regs.edi, regs.esi, 0, 0, regs.ebx, regs.edx, regs.ecx, regs.eax,
                    stack.eip, stack.cs, stack.eflags, stack.esp, stack.ss,
                )
            }
        }
    }

    /// Grows or shrinks the heap break point, per spec.md §4.7 `brk`.
    ///
    /// `new_addr` of 0 is a pure query. Shrinking always succeeds;
    /// growing rolls back any pages it managed to allocate before
    /// hitting [`virtmem::Error::OutOfMemory`].
    ///
    pub fn brk(&mut self, new_addr: u32) -> Result<u32, Error> {
        if new_addr == 0 {
            return Ok(self.break_point);
        }
        if new_addr < self.elf_break_point {
            return Err(Error::BreakBelowImage);
        }

        let new_top = align_up_u32(new_addr, PAGE_SIZE);
        let stack_bottom = self.user_stack_top - self.user_stack_size;
        if new_top > stack_bottom {
            return Err(Error::StackCollision);
        }

        let old_top = align_up_u32(self.break_point, PAGE_SIZE);
        let pdt = self.pdt.as_mut().expect("brk on a process with no PDT");
        let flags = Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESS;

        if new_top > old_top {
            let mut addr = old_top;
            while addr < new_top {
                if let Err(e) = pdt.allocate(addr, flags, false) {
                    let mut undo = old_top;
                    while undo < addr {
                        pdt.unmap(undo).ok();
                        undo += PAGE_SIZE;
                    }
                    return Err(e.into());
                }
                addr += PAGE_SIZE;
            }
        } else if new_top < old_top {
            let mut addr = new_top;
            while addr < old_top {
                pdt.unmap(addr).ok();
                addr += PAGE_SIZE;
            }
        }

        self.break_point = new_addr;
        self.pdt_changed = true;
        Ok(self.break_point)
    }

    /// Expands the user stack downward to reach `sz` bytes, page
    /// aligned and capped at [`max_user_stack`](Self::max_user_stack),
    /// per spec.md §4.7 `set_user_stack`. Idempotent for requests that
    /// would shrink the stack.
    ///
    pub fn set_user_stack(&mut self, sz: u32) -> Result<(), Error> {
        let sz = align_up_u32(sz, PAGE_SIZE);
        if sz <= self.user_stack_size {
            return Ok(());
        }
        if sz > self.max_user_stack {
            return Err(Error::StackTooLarge);
        }

        let new_bottom = self.user_stack_top - sz;
        if new_bottom < align_up_u32(self.break_point, PAGE_SIZE) {
            return Err(Error::StackCollision);
        }

        let old_bottom = self.user_stack_top - self.user_stack_size;
        let pdt = self.pdt.as_mut().expect("set_user_stack on a process with no PDT");
        let flags = Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESS;

        let mut addr = new_bottom;
        while addr < old_bottom {
            if let Err(e) = pdt.allocate(addr, flags, false) {
                let mut undo = new_bottom;
                while undo < addr {
                    pdt.unmap(undo).ok();
                    undo += PAGE_SIZE;
                }
                return Err(e.into());
            }
            addr += PAGE_SIZE;
        }

        self.user_stack_size = sz;
        self.pdt_changed = true;
        Ok(())
    }

    /// Tears down a process on exit: frees user-space pages and their
    /// physical frames, closes every file descriptor, frees the kernel
    /// stack, then frees the PDT.
    ///
    /// The caller must have already swapped off this process's PDT
    /// and kernel stack (e.g. into the idle process or the parent) so
    /// [`Pdt::free_user_space`]'s "not currently loaded" assertion
    /// holds and the kernel stack is not the one in current use.
    ///
    pub fn destroy(mut self) {
        let fds: Vec<u32> = self.files.keys().copied().collect();
        for fd in fds {
            self.close_file(fd);
        }

        if let Some(phys) = self.kernel_stack_phys.take() {
            physmem_free_stack(phys);
        }

        if let Some(pdt) = self.pdt.take() {
            pdt.free_user_space();
        }

        self.status = Status::Zombie;
    }
}

/// Allocates and zeroes one physical frame for a kernel stack, without
/// mapping it: kernel stacks live at a fixed virtual window
/// ([`memlayout::KERNEL_STACK_TOP`]) that the scheduler maps in and
/// out as it switches which process's stack is active, rather than
/// each process keeping a standing virtual mapping.
///
fn allocate_kernel_stack() -> Result<Option<u32>, Error> {
    physmem::PFA
        .lock()
        .allocate(false)
        .map(Some)
        .ok_or_else(|| Error::Paging(virtmem::Error::OutOfMemory))
}

fn physmem_free_stack(phys: u32) {
    physmem::PFA.lock().free(phys, false);
}

#[cfg(test)]
mod test {
    use super::*;

    fn blank_process() -> Process {
        let mut p = Process::default();
        p.user_stack_top = 0x8000_0000;
        p.user_stack_size = PAGE_SIZE;
        p.break_point = 0x0010_0000;
        p.elf_break_point = 0x0010_0000;
        p
    }

    #[test]
    fn brk_query_returns_current_break() {
        let mut p = blank_process();
        assert_eq!(p.brk(0), Ok(0x0010_0000));
    }

    #[test]
    fn brk_rejects_address_below_image() {
        let mut p = blank_process();
        assert_eq!(p.brk(0x1000), Err(Error::BreakBelowImage));
    }

    #[test]
    fn brk_rejects_stack_collision() {
        let mut p = blank_process();
        let stack_bottom = p.user_stack_top - p.user_stack_size;
        assert_eq!(p.brk(stack_bottom + PAGE_SIZE), Err(Error::StackCollision));
    }

    #[test]
    fn set_user_stack_is_idempotent_when_shrinking() {
        let mut p = blank_process();
        p.user_stack_size = 4 * PAGE_SIZE;
        assert_eq!(p.set_user_stack(PAGE_SIZE), Ok(()));
        assert_eq!(p.user_stack_size, 4 * PAGE_SIZE);
    }

    #[test]
    fn set_user_stack_rejects_oversized_request() {
        let mut p = blank_process();
        assert_eq!(p.set_user_stack(MAX_USER_STACK + PAGE_SIZE), Err(Error::StackTooLarge));
    }

    #[test]
    fn default_process_is_a_blank_fork_shell() {
        let p = Process::default();
        assert_eq!(p.status, Status::Invalid);
        assert!(p.children.is_empty());
        assert_eq!(p.parent, 0);
        assert_eq!(p.user_stack_top, USER_STACK_TOP);
        assert_eq!(p.max_user_stack, MAX_USER_STACK);
    }
}
