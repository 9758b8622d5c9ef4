//! Triggers a real stack overflow and confirms the kernel's own GDT/IDT
//! double-fault IST entry (`gdt::DOUBLE_FAULT_IST_INDEX`) catches it as a
//! double fault instead of triple-faulting the machine. `stack_overflow`
//! never returns, so the only way this binary reaches `panic` at all is
//! through the double-fault handler's own `panic!` — reaching it at all
//! is the pass condition.
#![no_std]
#![no_main]

use core::panic::PanicInfo;
use talon_kernel::{gdt, idt, println, testing};

#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    println!("stack_overflow::stack_overflow...");
    gdt::gdt_init();
    unsafe { idt::idt_init() };

    stack_overflow();

    unreachable!("stack_overflow() diverges by recursion");
}

#[allow(unconditional_recursion)]
fn stack_overflow() {
    stack_overflow();
    core::hint::black_box(0);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    println!("[ok]");
    testing::exit_qemu(testing::QemuExitCode::Success);
    loop {
        x86_64::instructions::hlt();
    }
}
