pub mod frontmatter;
pub mod runner;
pub mod security;

pub use frontmatter::{parse_front_matter, verify_against_manifest, FrontMatter};
pub use runner::{ExecOptions, ExecutionResult, ResultStatus, SandboxRunner};
pub use security::validate_script;
