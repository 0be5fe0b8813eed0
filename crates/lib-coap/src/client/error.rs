use thiserror::Error;

use crate::{
    client::token::TokenError,
    types::{Code, MessageError},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Code {0} is not a request")]
    NotARequest(Code),

    #[error("Client is shut down")]
    Closed,
}
