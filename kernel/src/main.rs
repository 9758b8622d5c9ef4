#![no_std]
#![no_main]

extern crate alloc;

use core::arch::asm;

use limine::memory_map::EntryType;
use limine::request::{MemoryMapRequest, RequestsEndMarker, RequestsStartMarker};
use limine::BaseRevision;

use alloc::boxed::Box;
use talon_ext2::{Ext2Config, MemoryBlockDevice};
use talon_log::{log, Level};
use talon_sched::{Policy, Priority};

use talon_kernel::{gdt, idt, print, println};

/// Identity-mapped MMIO bases for the local and I/O APIC (spec.md §4.D);
/// real hardware discovers these from ACPI/MADT, out of scope here, so
/// boot glue uses the architectural defaults.
const LAPIC_BASE: u64 = 0xFEE0_0000;
const IOAPIC_BASE: u64 = 0xFEC0_0000;

const INITIAL_HEAP_BYTES: u64 = 1024 * 1024;
const RAMDISK_BLOCKS: u32 = 2048;

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();
#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Converts the bootloader's memory map into the fixed-size region table
/// `talon_pmm::set_memory_map` expects. No heap yet, so this stays on the
/// stack rather than collecting into a `Vec`.
fn collect_regions(out: &mut [talon_pmm::MemoryRegion; 64]) -> usize {
    let mut count = 0;
    if let Some(resp) = MEMMAP_REQUEST.get_response() {
        for entry in resp.entries() {
            if count >= out.len() {
                break;
            }
            let kind = if entry.entry_type == EntryType::USABLE {
                talon_pmm::MemoryRegionType::Available
            } else {
                talon_pmm::MemoryRegionType::Reserved
            };
            out[count] = talon_pmm::MemoryRegion { base: entry.base, length: entry.length, kind };
            count += 1;
        }
    }
    count
}

fn shell_task() {
    loop {
        talon_sched::sleep(1).ok();
    }
}

#[unsafe(no_mangle)]
unsafe extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    println!("talon kernel starting");

    gdt::gdt_init();
    unsafe { idt::idt_init() };
    log!(Level::Info, "boot", "gdt/idt initialized");

    let mut regions = [talon_pmm::MemoryRegion { base: 0, length: 0, kind: talon_pmm::MemoryRegionType::Reserved }; 64];
    let region_count = collect_regions(&mut regions);
    talon_pmm::set_memory_map(&regions[..region_count]);
    log!(Level::Info, "boot", "pmm initialized from {} memory map entries", region_count);

    talon_vmm::init_kernel_space();
    talon_kernel::allocator::init_heap(INITIAL_HEAP_BYTES).expect("initial heap mapping");
    log!(Level::Info, "boot", "heap online, {} bytes", INITIAL_HEAP_BYTES);

    unsafe { asm!("sti") };
    log!(Level::Info, "boot", "interrupts enabled");

    let topo = talon_smp::detect_topology();
    log!(Level::Info, "boot", "cpu vendor={:?} logical_count={}", topo.vendor, topo.logical_processor_count);

    let lapic_flags = talon_vmm::VmmFlags { read: true, write: true, exec: false, user: false };
    let _ = talon_vmm::map_kernel_page(LAPIC_BASE, LAPIC_BASE, lapic_flags);
    let _ = talon_vmm::map_kernel_page(IOAPIC_BASE, IOAPIC_BASE, lapic_flags);
    talon_smp::init(LAPIC_BASE, IOAPIC_BASE, 0);
    let _ = talon_smp::init_local_apic();
    let _ = talon_smp::init_io_apic(24);

    talon_sched::init();
    talon_sched::start().ok();
    let _ = talon_sched::create_task("shell", Priority::Normal, Policy::RoundRobin, 16 * 1024, shell_task);
    log!(Level::Info, "boot", "scheduler started, {} tasks", talon_sched::task_count());

    talon_ipc::init();
    log!(Level::Info, "boot", "ipc queues initialized");

    talon_vfs::init();
    talon_vfs::mount_memory("/").expect("mount root scratch fs");
    let device = Box::new(MemoryBlockDevice::new(RAMDISK_BLOCKS));
    match talon_vfs::mount_ext2("/mnt", device, Ext2Config::default()) {
        Ok(_) => log!(Level::Info, "boot", "ext2 ramdisk mounted at /mnt"),
        Err(e) => log!(Level::Warning, "boot", "ext2 ramdisk mount failed: {:?}", e),
    }
    talon_fsd::init();
    log!(Level::Info, "boot", "vfs/fsd ready");

    println!("talon kernel ready");
    run_console();
}

/// Line-buffered console loop over the serial port, the kernel's actual
/// interactive surface until a framebuffer font asset exists to back
/// `framebuffer::ScrollingTextRenderer`.
fn run_console() -> ! {
    let mut line: heapless::String<256> = heapless::String::new();
    print!("> ");
    loop {
        let byte = talon_kernel::serial::SERIAL1.lock().receive();
        match byte {
            b'\r' | b'\n' => {
                println!();
                let _ = talon_console::execute(&line, &mut |s| println!("{}", s));
                line.clear();
                print!("> ");
            }
            0x08 | 0x7f => {
                line.pop();
            }
            b if (line.len() < line.capacity()) && b.is_ascii() && !b.is_ascii_control() => {
                let _ = line.push(b as char);
                print!("{}", b as char);
            }
            _ => {}
        }
    }
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    println!("KERNEL PANIC: {}", info);
    hcf();
}

fn hcf() -> ! {
    loop {
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!("cli", "hlt");
            #[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
            asm!("wfi");
            #[cfg(target_arch = "loongarch64")]
            asm!("idle 0");
        }
    }
}
