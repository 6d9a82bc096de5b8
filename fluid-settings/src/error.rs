//! Error types for the settings engine and the client session.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] fluid_settings_model::ModelError),

    #[error("definition error: {0}")]
    Definition(String),

    #[error("the session task is gone")]
    SessionClosed,
}
