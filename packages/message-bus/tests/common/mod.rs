// Common test utilities
#![allow(dead_code)]

use message_bus::{Command, Event, Message};
use serde::{Deserialize, Serialize};

/// Install a test-writer subscriber once. Run with `RUST_LOG=debug` to see bus logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUser {
    pub email: String,
}

impl Message for CreateUser {}
impl Command for CreateUser {
    type Output = u64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: u64,
    pub email: String,
}

impl Message for UserCreated {
    fn message_type() -> &'static str {
        "user.created.v1"
    }
}
impl Event for UserCreated {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendWelcome {
    pub user_id: u64,
}

impl Message for SendWelcome {}
impl Command for SendWelcome {
    type Output = ();
}
