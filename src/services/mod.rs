//! External collaborators reached over the network
//!
//! Both are best-effort: lookups are time-boxed and pushes are fire-and-forget.

pub mod diagnostics;
pub mod volatility;

pub use diagnostics::{BarSnapshot, DiagnosticsSink, HttpDiagnostics, TracingDiagnostics};
pub use volatility::{
    recommend_within, HttpVolatilityService, VolatilityError, VolatilityRequest, VolatilityService,
};
