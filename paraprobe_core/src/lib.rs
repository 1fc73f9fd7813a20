pub mod config;
pub mod enumerate;
pub mod extract;
pub mod locate;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod score;
pub mod state;
pub mod work;

pub use config::ProbeConfig;
pub use enumerate::{EnumerateError, Enumeration, PayloadSource, UrlSource};
pub use extract::{ExtractError, ExtractorConfig, ParameterCorpus, ParameterExtractor};
pub use locate::{LocateError, ResolvedTools, locate_tools};
pub use report::{ReportError, ReportWriter};
pub use runner::{InvocationResult, InvocationStatus, Invoker, InvokerConfig, ToolInvoker};
pub use schedule::{RunOutcome, ScheduleError, Scheduler, SchedulerConfig};
pub use score::{ScoredResult, Summary, SummaryEntry, aggregate, score};
pub use state::{StateError, StateRecord, StateStore};
pub use work::WorkItem;
