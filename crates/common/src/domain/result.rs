use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid source ID: {0}")]
    InvalidSourceId(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}
