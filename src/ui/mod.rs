//! Terminal output for the CLI
//!
//! Uses `cliclack` styling in an interactive terminal and plain tagged lines
//! everywhere else, so output stays greppable in scripts and CI.

mod context;
mod output;
mod prompts;

pub use context::UiContext;
pub use output::{
    format_bytes, key_value, remark, section, step_error_detail, step_info, step_ok,
    step_ok_detail, step_warn_hint,
};
pub use prompts::confirm;
