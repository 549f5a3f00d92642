// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use bytes::Bytes;
use ipcbus::{Message, Value};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let bytes = Bytes::copy_from_slice(data);
    if let Ok(value) = Value::decode(&bytes) {
        // Re-encoding a decoded value must stay decodable
        assert!(Value::decode(&value.to_bytes()).is_ok());
        let _ = Message::from_value(&value);
    }
});
