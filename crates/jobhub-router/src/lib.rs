//! jobhub Router
//!
//! Two halves of the hub's messaging:
//! - [`MessageHandler`]: validates inbound wire messages and dispatches them to
//!   the handler registered for their type.
//! - [`MessageRouter`]: takes outbound messages through filtering,
//!   transformation and rule evaluation, then delivers them through an injected
//!   [`DeliveryTransport`], queueing or dead-lettering as configured.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod transport;

pub use config::{QueueOverflowPolicy, RouterConfig};
pub use error::{HandlerError, RoutingError};
pub use handler::{
    FnHandler, Handler, MessageContext, MessageHandler, MessageStatistics,
};
pub use router::{
    ChannelStatistics, ConditionOperator, DeadLetter, FilterDecision, FnFilter, FnTransformer,
    MessageFilter, MessageRouter, MessageTransformer, RouteTarget, RoutingOutcome,
    RoutingRule, RoutingStatistics, RuleAction, RuleCondition,
};
pub use transport::{DeliveryTransport, Target, TargetKind};
