pub mod catalog;
pub mod engine;

pub use catalog::builtin_engine;
pub use engine::{
    ExpandOptions, ParameterType, Template, TemplateEngine, TemplateParameter,
};
