//! Sulpher query engine: lexer, parser, planner, binding-extension
//! executor, and the REST-level graph algorithms.

pub mod algo;
pub mod ast;
mod error;
pub mod executor;
pub mod lexer;
pub mod parser;
pub mod planner;

pub use crate::error::{Error, Result};
pub use crate::executor::{ExecOptions, Executor, QueryOutput, Row, Value};

use rserv_api::GraphView;

/// Parses, plans, and runs a Sulpher query in one call.
pub fn query_collect(view: &dyn GraphView, input: &str, opts: ExecOptions) -> Result<QueryOutput> {
    let query = parser::Parser::parse(input)?;
    let plan = planner::QueryPlanner::new().plan(query)?;
    Executor::new(view, opts).execute(&plan)
}
