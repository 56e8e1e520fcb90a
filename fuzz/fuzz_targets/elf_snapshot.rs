#![no_main]

use std::{io::Write, os::fd::OwnedFd};

use libfuzzer_sys::fuzz_target;
use snapmap::ExecutableImage;

fuzz_target!(|data: &[u8]| {
    let Ok(mut file) = tempfile::tempfile() else {
        return;
    };
    if file.write_all(data).is_err() {
        return;
    }
    let _ = ExecutableImage::load_fd(OwnedFd::from(file));
});
