//! Query language, planning and the iterator tree

pub mod ast;
pub mod expr;
pub mod hybrid;
pub mod iterators;
pub mod parser;
pub mod planner;
pub mod request;
pub mod timeout;

pub use ast::{KnnClause, ParsedQuery, QueryNode};
pub use hybrid::{HybridMode, HybridReport, HybridStage};
pub use planner::{PlanOptions, Planner};
pub use timeout::{Deadline, Partial, TimeoutCheck};
