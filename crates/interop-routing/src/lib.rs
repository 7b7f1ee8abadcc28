//! Rule-driven routing engine (C9): condition evaluation and forward/transform/drop/log
//! action dispatch, with a priority-ordered catch-all fallback (§4.8).

pub mod engine;
pub mod rule;

pub use engine::{RoutingEngine, RoutingResult};
pub use rule::{Condition, Operator, RouteAction, RouteRule};
