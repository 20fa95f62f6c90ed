//! Fuzz target for handshake identity parsing.
//!
//! A handshake with an arbitrary claimed database id must either parse or be
//! rejected cleanly, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_loader::incoming::IncomingConnectionInfo;
use replication_loader::transport::HandshakeRequest;

fuzz_target!(|data: (&str, &str, &str)| {
    let (id, database, url) = data;
    let request = HandshakeRequest {
        source_machine_name: "fuzz".to_string(),
        source_database_name: database.to_string(),
        source_database_id: id.to_string(),
        source_url: url.to_string(),
        api_key: None,
    };
    let _ = IncomingConnectionInfo::from_handshake(&request);
});
