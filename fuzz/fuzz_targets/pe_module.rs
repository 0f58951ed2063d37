#![no_main]

use libfuzzer_sys::fuzz_target;
use ntenv::image::Module;

fuzz_target!(|data: &[u8]| {
    let _ = Module::from_pe(data, "c:\\fuzz\\input.exe");
});
