//! Fuzz target for wire message decoding.
//!
//! Deserializing arbitrary bytes into a `ReplicationMessage` must never
//! panic; malformed frames come back as errors.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_loader::transport::ReplicationMessage;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ReplicationMessage>(data);
});
