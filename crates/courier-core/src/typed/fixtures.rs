//! Message and handler types shared by the unit tests.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::handler::Handler;
use super::message::Message;
use crate::error::BoxError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMessage {
    pub id: u64,
}

impl Default for TestMessage {
    fn default() -> Self {
        Self { id: 1 }
    }
}

impl Message for TestMessage {
    const KEY: Option<&'static str> = Some("test1");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMessage1 {
    pub id: u64,
}

impl Default for TestMessage1 {
    fn default() -> Self {
        Self { id: 2 }
    }
}

impl Message for TestMessage1 {
    const KEY: Option<&'static str> = Some("test2");
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: u64,
}

impl Message for Ping {}

/// Records the bound functions it ran.
#[derive(Debug, Default)]
pub struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn record(&self, method: &str) {
        self.seen.lock().unwrap().push(method.to_string());
    }

    pub fn test_message(&self, _message: &TestMessage) -> Result<String, BoxError> {
        self.record("test_message");
        Ok("handled".to_string())
    }

    pub fn test_message1(&self, _message: &TestMessage1) -> Result<String, BoxError> {
        self.record("test_message1");
        Ok("handled1".to_string())
    }

    pub fn ping(&self, _message: &Ping) -> Result<String, BoxError> {
        self.record("ping");
        Ok("pong".to_string())
    }
}

impl Handler for Recorder {
    type Output = String;

    fn handler_name() -> String {
        "recorder".to_string()
    }
}
