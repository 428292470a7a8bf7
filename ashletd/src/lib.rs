//! Library half of the `ashletd` binary: the IPC accept loop and connection
//! handler, kept separate from `main` so it can be exercised by tests
//! without a real socket.

pub mod ipc;
