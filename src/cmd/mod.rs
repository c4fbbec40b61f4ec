//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `config` | `CheckConfig`    |

pub mod config;
pub mod serve;

pub use config::cmd_check_config;
pub use serve::cmd_serve;
