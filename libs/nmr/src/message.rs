//! # Messages
//!
//! Payload envelopes stored in the in, out and fault slots of an
//! [`Exchange`](crate::Exchange): a JSON body plus content metadata, headers
//! and attachments.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable message envelope carried in one slot of an exchange
///
/// The body is reference counted: [`Message::copy`] shares it, while headers
/// and attachments are copied so the two messages can diverge.
#[derive(Debug, Default)]
pub struct Message {
    body: Option<Arc<Value>>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    headers: HashMap<String, Value>,
    attachments: HashMap<String, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message with a body
    pub fn with_body(body: impl Into<Value>) -> Self {
        let mut message = Self::new();
        message.set_body(body);
        message
    }

    pub fn body(&self) -> Option<Arc<Value>> {
        self.body.clone()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = Some(Arc::new(body.into()));
    }

    /// Share an existing body without cloning the value
    pub fn set_shared_body(&mut self, body: Arc<Value>) {
        self.body = Some(body);
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn set_content_encoding(&mut self, encoding: impl Into<String>) {
        self.content_encoding = Some(encoding.into());
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Set a header, returning the previous value
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.headers.insert(name.into(), value.into())
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    pub fn attachment(&self, id: &str) -> Option<&Value> {
        self.attachments.get(id)
    }

    pub fn add_attachment(&mut self, id: impl Into<String>, value: impl Into<Value>) {
        self.attachments.insert(id.into(), value.into());
    }

    pub fn remove_attachment(&mut self, id: &str) -> Option<Value> {
        self.attachments.remove(id)
    }

    pub fn attachments(&self) -> &HashMap<String, Value> {
        &self.attachments
    }

    /// Independent copy sharing only the body
    pub fn copy(&self) -> Message {
        Message {
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            headers: self.headers.clone(),
            attachments: self.attachments.clone(),
        }
    }
}
