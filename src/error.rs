use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HookError>;

#[derive(Debug, Error)]
pub enum HookError {
  /// Every candidate for a logical name was tried and none matched.
  #[error("could not resolve `{logical}`, all candidates exhausted")]
  NotFound { logical: String },

  /// The interception point is already owned by another strategy.
  #[error("interception point `{point}` is already owned by {owner}")]
  InstallConflict { point: String, owner: String },

  /// Rewriting a code unit failed, the unit is left unmodified.
  #[error("failed to rewrite `{unit}`: {reason}")]
  TransformFailure { unit: String, reason: String },

  #[error("{what} did not complete within {after:?}")]
  TimedOut { what: String, after: Duration },

  /// The handle was produced before the resolver was invalidated.
  #[error("handle for `{logical}` is stale")]
  StaleHandle { logical: String },

  #[error("host error: {0}")]
  Host(String),

  #[error("memory access at {address:#X} failed: {reason}")]
  Memory { address: usize, reason: String },

  #[error("assembler error: {0}")]
  Assemble(String),

  #[error("invalid lifecycle state: {0}")]
  InvalidState(String),

  #[error("config error: {0}")]
  Config(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl HookError {
  pub fn host(reason: impl Into<String>) -> Self { HookError::Host(reason.into()) }

  pub fn not_found(logical: impl Into<String>) -> Self { HookError::NotFound { logical: logical.into() } }

  pub fn memory(address: usize, reason: impl Into<String>) -> Self { HookError::Memory { address, reason: reason.into() } }
}

impl From<iced_x86::IcedError> for HookError {
  fn from(e: iced_x86::IcedError) -> Self { HookError::Assemble(e.to_string()) }
}

impl From<toml::de::Error> for HookError {
  fn from(e: toml::de::Error) -> Self { HookError::Config(e.to_string()) }
}

impl From<toml::ser::Error> for HookError {
  fn from(e: toml::ser::Error) -> Self { HookError::Config(e.to_string()) }
}
