// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use ipcbus::FrameReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed in two chunks so partial-frame buffering is exercised too
    let split = data.first().map(|b| *b as usize % (data.len() + 1)).unwrap_or(0);
    let mut reader = FrameReader::new(64 * 1024);

    reader.feed(&data[..split]);
    while let Ok(Some(frame)) = reader.try_decode_one() {
        if let Some(payload) = frame.payload {
            let _ = payload.to_args();
        }
    }

    reader.feed(&data[split..]);
    while let Ok(Some(frame)) = reader.try_decode_one() {
        if let Some(payload) = frame.payload {
            let _ = payload.to_args();
        }
    }
});
