//! formkit - a headless, metadata-driven document-form engine.
//!
//! This crate owns the client side of a schema-driven application: it
//! caches documents and doctype metadata, projects documents onto a
//! field layout, runs per-doctype lifecycle scripts, and orchestrates
//! the save/submit/cancel workflows with permission gates and user
//! confirmation. Rendering widgets and network transport stay behind
//! capability interfaces.

pub mod config;
pub mod error;
pub mod events;
pub mod form;
pub mod layout;
pub mod rpc;
pub mod scripts;
pub mod session;
pub mod store;
pub mod ux;
pub mod views;

pub use config::Config;
pub use error::FormError;
pub use events::{EventBus, FormEvent};
pub use form::{DfProperty, FieldSelector, Form, FormDeps, SaveOutcome};
pub use rpc::RpcClient;
pub use scripts::{hook, lifecycle, ScriptContext, ScriptManager};
pub use session::FormRegistry;
pub use store::{DocumentStore, MetaStore};
