pub mod document;
pub mod meta;

pub use document::{DocumentStore, FieldChange, ModelEvent};
pub use meta::MetaStore;
