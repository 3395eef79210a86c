//! div gateway: reconciles deployments into releases and installs, and
//! runs each install as a job.
//!
//! One gateway serves one cluster. It watches three kinds and cascades:
//!
//! ```text
//! Deployment <name>          (sha1)
//!   └─► Release <name>-<cluster>        applied when missing or sha1 differs
//!         └─► Install <release>-<sha1>  created once, phase = pending
//!               └─► Executor::submit    pending → running → completed | failed
//! ```
//!
//! # Components
//!
//! - **`targets`**: the projects and applications this gateway serves
//! - **`controller`**: the single-flight event loop and cascade rules
//! - **`executor`**: job submission boundary and the shell implementation
//! - **`policy`**: opt-in recovery for stuck installs and broken watches

pub mod controller;
pub mod error;
pub mod executor;
pub mod policy;
pub mod targets;

pub use controller::Controller;
pub use error::{ExecError, GatewayError, GatewayResult};
pub use executor::{Executor, JobSubmission, ProcessExecutor, SubmitFuture, Tee, INSTALL_EVENT};
pub use policy::RecoveryPolicy;
pub use targets::Targets;
