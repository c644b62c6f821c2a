//! Template catalog: entity model, location annotations and template lookup.
//!
//! Templates are catalog entities of kind `Template`. The scaffolder only
//! reads them: [`TemplateResolver`] is the seam used at submit time, with an
//! in-memory catalog for embedding and tests and a directory catalog that
//! reads YAML files from disk.
//!
//! # Example
//!
//! ```ignore
//! use scaffolder::catalog::{DirectoryCatalog, TemplateResolver};
//!
//! let catalog = DirectoryCatalog::load("templates/")?;
//! let template = catalog.find_template("react-ssr-template").await?;
//! ```

pub mod entity;
pub mod resolver;

pub use entity::{
    parse_location_annotation, LocationSpec, TemplateEntity, TemplateMetadata, TemplateSpec,
    LOCATION_ANNOTATION, TEMPLATE_KIND,
};
pub use resolver::{validate_template_name, DirectoryCatalog, InMemoryCatalog, TemplateResolver};
