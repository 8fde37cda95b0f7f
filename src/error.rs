use thiserror::Error;

/// Represents errors that can occur in the template engine.
#[derive(Error, Debug)]
pub enum TplError {
    #[error("Template not found: {0}")]
    NotFound(String),
    #[error("Parse error in '{template}' at byte {offset}: {message}")]
    Parse {
        template: String,
        offset: usize,
        message: String,
    },
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),
    #[error("Render error in '{template}': {message}")]
    Render { template: String, message: String },
    #[error("Include cycle detected: {0}")]
    IncludeCycle(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TplError {
    pub fn parse(template: impl Into<String>, offset: usize, message: impl Into<String>) -> Self {
        TplError::Parse {
            template: template.into(),
            offset,
            message: message.into(),
        }
    }

    pub fn render(template: impl Into<String>, message: impl Into<String>) -> Self {
        TplError::Render {
            template: template.into(),
            message: message.into(),
        }
    }
}
