//! Message transformers.

use jobhub_core::BaseMessage;

/// A named, prioritized transformer. Higher priorities run first.
pub trait MessageTransformer: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    /// Return a replacement message, or `None` to leave it unchanged.
    fn transform(&self, message: &BaseMessage) -> Option<BaseMessage>;
}

/// A transformer backed by a closure.
pub struct FnTransformer<F> {
    name: String,
    priority: i32,
    f: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(&BaseMessage) -> Option<BaseMessage> + Send + Sync,
{
    pub fn new(name: impl Into<String>, priority: i32, f: F) -> Self {
        Self {
            name: name.into(),
            priority,
            f,
        }
    }
}

impl<F> MessageTransformer for FnTransformer<F>
where
    F: Fn(&BaseMessage) -> Option<BaseMessage> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(&self, message: &BaseMessage) -> Option<BaseMessage> {
        (self.f)(message)
    }
}
