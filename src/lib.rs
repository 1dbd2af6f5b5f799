//! fieldsync - Local-first form and submission store for offline data collection
//!
//! This library keeps downloaded form definitions and the instances filled
//! from them on disk, queries CSV datasets bundled with forms, submits
//! finalized instances to an OpenRosa-style server, and keeps the local form
//! set in step with the server's.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod external;
pub mod forms;
pub mod instances;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod upload;

/// Re-export commonly used types
pub use app::App;
pub use config::Settings;
pub use error::{Error, Result};
pub use external::{ExternalDataSession, SearchQuery, SearchType};
pub use forms::{Form, FormFilter, FormMetadata, FormRegistry};
pub use instances::{Instance, InstanceRegistry, InstanceSaver, InstanceStatus, SaveRequest};
pub use storage::{StoragePaths, Subdirectory};
pub use sync::{FormSynchronizer, SyncMode, SyncReport};
pub use transport::{Credentials, HttpTransport, OpenRosaTransport};
pub use upload::InstanceUploader;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "fieldsync";
