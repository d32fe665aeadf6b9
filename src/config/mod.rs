//! Endpoint configuration, session timing policy and persisted viewer preferences

mod schema;
mod store;

pub use schema::{CameraConfig, SessionPolicy, SignalingKind};
pub use store::{Preference, PreferenceChange, PreferenceStore};
