//! Camera sessions
//!
//! A session shares one endpoint among any number of consumers. It keeps at
//! most one [`Call`] (connection attempt) alive, driven by a watchdog that
//! starts, extends and expires calls, and falls back to snapshots whenever
//! no consumer is presenting live media.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use camview::config::{CameraConfig, PreferenceStore};
//! use camview::peer::PeerConfig;
//! use camview::session::{ConsumerHandle, SessionContext, SessionRegistry};
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> camview::error::Result<()> {
//! let ctx = SessionContext::new(PreferenceStore::in_memory(), PeerConfig::default());
//! let registry = SessionRegistry::new(ctx);
//!
//! let mut config = CameraConfig::for_entity("camera.front_door");
//! config.url = Some("http://go2rtc.local:1984".to_string());
//! let session = registry.session(&config).await?;
//!
//! let consumer = Arc::new(ConsumerHandle::new());
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! session.attach(&consumer, tx);
//! while let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod consumers;
pub mod key;
pub mod orchestrator;
pub mod registry;
pub mod watchdog;

pub use call::Call;
pub use consumers::{ConsumerHandle, ConsumerId, ConsumerRegistry};
pub use key::EndpointKey;
pub use orchestrator::{AttachOutcome, SessionContext, SessionOrchestrator, TerminationHook};
pub use registry::SessionRegistry;
pub use watchdog::{next_delay, Watchdog};
