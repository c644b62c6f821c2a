//! Validation of submitted template values.
//!
//! Values are augmented with the parsed repository destination and then
//! checked against the template's JSON Schema before a task is created.

pub mod values;

pub use values::{augment_values, JsonSchemaValidator, ValuesValidator, STORE_PATH_KEY};
