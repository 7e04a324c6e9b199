pub mod codes;
mod severity;
mod trace;

pub use codes::{CodeDef, CodeRegistry};
pub use severity::{ParseSeverityError, Severity};
pub use trace::{StackFrame, TracedError, TracedErrorBuilder, COPY_INSTRUCTION};
