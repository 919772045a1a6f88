//! Data model for the diagnostic simulator

mod audit;
mod events;
mod metrics;
mod request;
mod run;
mod scenario;
mod session;

pub use audit::*;
pub use events::*;
pub use metrics::*;
pub use request::*;
pub use run::*;
pub use scenario::*;
pub use session::*;
