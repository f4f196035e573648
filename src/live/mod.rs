//! Subscription bindings on top of a shared [`ConnectionManager`].
//!
//! A [`Session`] owns the manager for the lifetime of a credential. Bindings
//! turn consumer lifecycle into control messages on that manager:
//!
//! - [`MessageSubscription`]: forwards one message type to one handler
//! - [`RunLogSubscription`]: accumulates the log lines of one run
//! - [`TaskUpdateSubscription`]: forwards task updates of one project
//!
//! Each binding sends its `subscribe_*` request whenever the manager becomes
//! connected, so a reconnect restores every stream without consumer
//! involvement. Stopping or dropping a binding unsubscribes it; bindings
//! never open or close the channel themselves.
//!
//! # Example
//!
//! ```rust, no_run
//! use runboard_live::live::{RunLogSubscription, Session, SessionConfig};
//! use secrecy::SecretString;
//!
//! # async fn run() -> runboard_live::Result<()> {
//! let mut session = Session::new(
//!     SessionConfig::builder().api_base("http://localhost:8000").build(),
//! )?;
//! session.set_credential(Some(SecretString::from("token".to_owned())))?;
//!
//! if let Some(manager) = session.manager() {
//!     let mut logs = RunLogSubscription::new(manager);
//!     logs.start("p1", Some("r1"));
//!     // later
//!     println!("{} lines", logs.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`ConnectionManager`]: crate::ws::ConnectionManager

pub mod run_logs;
pub mod session;
pub mod subscription;
pub mod task_updates;
pub mod types;

pub use run_logs::RunLogSubscription;
pub use session::{Session, SessionConfig};
pub use subscription::MessageSubscription;
pub use task_updates::TaskUpdateSubscription;
