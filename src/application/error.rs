use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::{mutations::MutationError, preferences::PreferenceError},
    cache::QueryError,
    config::LoadError,
    infra::{error::InfraError, gateway::GatewayError},
};

/// Flattened error chain for logging at the binary boundary.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Preferences(#[from] PreferenceError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            Self::Query(error) => error.gateway(),
            Self::Mutation(error) => error.gateway(),
            Self::Gateway(error) => Some(error),
            _ => None,
        }
    }

    /// What to show the user. Server faults get a generic message; validation
    /// messages pass through verbatim so they can be mapped to a field.
    pub fn presentation_message(&self) -> String {
        match self.gateway() {
            Some(GatewayError::Network { .. }) => {
                "The library is unreachable, try again".to_string()
            }
            Some(GatewayError::Unauthorized) => "Your session has expired".to_string(),
            Some(GatewayError::Forbidden { .. }) => "You are not allowed to do that".to_string(),
            Some(GatewayError::NotFound { .. }) => "Not found".to_string(),
            Some(GatewayError::Server { .. }) => "The server failed, try again".to_string(),
            Some(GatewayError::Validation { message, .. }) => message.clone(),
            Some(GatewayError::Decode { .. } | GatewayError::InvalidRequest { .. }) => {
                "Unexpected response from the library".to_string()
            }
            None => match self {
                Self::Validation(message) => message.clone(),
                Self::Preferences(error) => error.to_string(),
                Self::Config(_) => "Client misconfigured".to_string(),
                _ => "Unexpected error occurred".to_string(),
            },
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.gateway() {
            Some(GatewayError::Unauthorized | GatewayError::Forbidden { .. }) => 3,
            Some(GatewayError::NotFound { .. }) => 4,
            Some(GatewayError::Network { .. } | GatewayError::Server { .. }) => 5,
            Some(_) => 1,
            None => match self {
                Self::Config(_) | Self::Validation(_) | Self::Preferences(_) => 2,
                _ => 1,
            },
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }
}
