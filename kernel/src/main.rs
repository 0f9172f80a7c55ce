//! The kernel's entry point: wires together the subsystems built as
//! their own workspace members (`physmem`, `virtmem`, `multiboot`,
//! `filesystem`, `process`, `storage`, `serial`) into the boot sequence
//! GRUB's Multiboot hand-off starts.
//!
//! `boot.s` has already built and loaded an initial page directory
//! mapping the kernel at [`memlayout::KERNEL_VIRTUAL_BASE`] before
//! jumping here; everything below runs in the higher half, with
//! interrupts still disabled. There is no IDT in this port
//! ([`interrupts::without_interrupts`] only ever toggles `EFLAGS.IF`
//! around critical sections), so the one process this boot sequence
//! launches runs without preemption or syscalls.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;
use core::arch::{asm, global_asm};
use core::panic::PanicInfo;
use filesystem::{devfs, memfs, FileSystem};
use physmem::PhysAddr;
use serial::println;
use virtmem::Pdt;

mod gdt;

global_asm!(include_str!("boot.s"));

extern "C" {
    static __kernel_phys_start: u8;
    static __kernel_phys_end: u8;
}

/// The real entry point, reached from `boot.s` once paging is enabled
/// and the CPU is executing in the higher half.
///
/// `magic`/`info_phys` are exactly what Multiboot handed GRUB: the
/// magic value (checked against [`multiboot::MAGIC`]) and the physical
/// address of the Multiboot information structure.
///
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info_phys: u32) -> ! {
    serial::init();
    println!("firefly: booting");

    let kernel_phys_start = unsafe { &__kernel_phys_start as *const u8 as PhysAddr };
    let kernel_phys_end = unsafe { &__kernel_phys_end as *const u8 as PhysAddr };
    physmem::PFA.lock().initialise(kernel_phys_start, kernel_phys_end);

    let mut kernel_pdt = Pdt::from_loaded();
    virtmem::reserve_scratch_page_table(&mut kernel_pdt).expect("failed to reserve scratch page table");
    virtmem::init_heap(&mut kernel_pdt).expect("failed to map kernel heap");

    let info = multiboot::parse(magic, info_phys, &mut kernel_pdt).expect("failed to parse multiboot info");
    let entries: Vec<physmem::MemoryMapEntry> = info.memory_map.iter().copied().map(Into::into).collect();
    physmem::PFA.lock().apply_memory_map(&entries);
    physmem::PFA.lock().debug();

    filesystem::mount_virtual("/", FileSystem::Mem(memfs::MemFs::new()));
    filesystem::mount_virtual("/dev", FileSystem::Dev(devfs::DevFs::new()));
    storage::block::iter(|dev| println!("firefly: storage device {}", dev.name));

    gdt::init();
    let selectors = gdt::selectors();

    let pid = match process::Process::new("/bin/init") {
        Ok(proc) => process::with_table(|table| table.insert(proc)),
        Err(e) => {
            println!("firefly: failed to load /bin/init: {:?}", e);
            halt();
        }
    };

    let result = process::with_table(|table| table.with(pid, |proc| proc.launch(&mut kernel_pdt, &selectors)));

    match result {
        Some(Ok(_)) => unreachable!("Process::launch never returns on success"),
        Some(Err(e)) => println!("firefly: failed to launch /bin/init: {:?}", e),
        None => println!("firefly: init process vanished from the table"),
    }
    halt();
}

fn halt() -> ! {
    loop {
        unsafe { asm!("hlt") };
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("firefly: panic: {}", info);
    halt()
}
