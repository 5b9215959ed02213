use thiserror::Error;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not connect to device: {0}")]
    Connection(String),

    #[error("remote command exited with status {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("device launch failed: {0}")]
    Launch(String),

    #[error("shutdown step '{step}' failed: {reason}")]
    ShutdownStep { step: &'static str, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Error = RigError;
pub type Result<T> = std::result::Result<T, Error>;
