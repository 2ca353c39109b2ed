//! Query pipeline
//!
//! Stages describe what a statement does; the stage manager compiles them
//! into a program of operations over transient tables, and the program
//! runs in one atomic section.

pub mod fragment;
pub mod manager;
pub mod program;
pub mod stage;

pub use fragment::Fragment;
pub use manager::{Job, JobInput, StageManager, TransientArena, MAIN_JOB};
pub use program::{Outcome, Program};
pub use stage::{
    ExpressionStage, GroupStage, ImpossibleWhereStage, IndexStage, LimitStage, NoTableStage,
    OrderStage, Stage, StageAction, TruncateStage, WhereStage,
};
