#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Must never panic, whichever backend is selected
    let _ = zenheic::decode_config(data);
    let _ = zenheic::decode(data, enough::Unstoppable);

    // The sandbox must contain whatever the decoder does with hostile input
    if let Ok(sandbox) = zenheic::SandboxBackend::bundled() {
        let limits = zenheic::Limits {
            max_pixels: Some(16 * 1024 * 1024),
            ..Default::default()
        };
        let _ = sandbox.decode_with_limits(data, &limits, enough::Unstoppable);
    }
});
