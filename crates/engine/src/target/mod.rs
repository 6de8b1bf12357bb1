//! Target expressions and their resolution against a node inventory.

pub mod expr;
pub mod resolver;
pub mod size;

pub use expr::{CONTROL_KEYWORD, TargetExpr, TargetType};
pub use resolver::{Inventory, NodeAttributes, TargetResolver};
pub use size::SizeBound;
