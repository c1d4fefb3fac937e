// Templates module
// Declarative job templates and their registry

pub mod models;
pub mod registry;

pub use models::{parse_template, TemplateDocument};
pub use registry::{InMemoryTemplateRegistry, TemplateRegistry};
