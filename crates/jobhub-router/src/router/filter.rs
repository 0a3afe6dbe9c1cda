//! Message filters.

use jobhub_core::BaseMessage;

/// Result of running a filter over a message.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Allow,
    /// Drop the message. Counted, never dead-lettered.
    Deny(String),
    /// Continue with a replacement message.
    Modify(BaseMessage),
}

/// A named, prioritized filter. Higher priorities run first.
///
/// Filters must be pure: the same message always yields the same decision.
pub trait MessageFilter: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn apply(&self, message: &BaseMessage) -> FilterDecision;
}

/// A filter backed by a closure.
pub struct FnFilter<F> {
    name: String,
    priority: i32,
    f: F,
}

impl<F> FnFilter<F>
where
    F: Fn(&BaseMessage) -> FilterDecision + Send + Sync,
{
    pub fn new(name: impl Into<String>, priority: i32, f: F) -> Self {
        Self {
            name: name.into(),
            priority,
            f,
        }
    }
}

impl<F> MessageFilter for FnFilter<F>
where
    F: Fn(&BaseMessage) -> FilterDecision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn apply(&self, message: &BaseMessage) -> FilterDecision {
        (self.f)(message)
    }
}
