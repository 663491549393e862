#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Reading and validating arbitrary bytes should never panic.
    if let Ok(mut model) = lumen_format::read_model(data) {
        let _ = lumen_opt::PassManager::for_level(lumen_opt::OptLevel::O0).run(&mut model);
    }
});
