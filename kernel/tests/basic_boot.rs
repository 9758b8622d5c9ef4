#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(talon_kernel::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use talon_kernel::println;

#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    test_main();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    talon_kernel::testing::test_panic_handler(info)
}

#[test_case]
fn prints_to_serial() {
    println!("basic_boot output");
}

#[test_case]
fn logger_records_an_entry() {
    talon_log::log!(talon_log::Level::Info, "test", "basic boot smoke entry");
    assert!(talon_log::LOGGER.len() >= 1);
}
