use crate::error::{HookError, Result};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use std::{fs::File, path::{Path, PathBuf}};

/// Terminal plus file logging. The file goes next to `preferred` or, failing that, into the temp
/// directory. Returns the log file path, `None` if no file could be created.
pub fn init(level: LevelFilter, preferred: impl AsRef<Path>) -> Result<Option<PathBuf>> {
  let config = ConfigBuilder::new().set_target_level(LevelFilter::Off).set_thread_level(LevelFilter::Debug).build();

  let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto)];

  let preferred = preferred.as_ref().to_path_buf();
  let fallback = std::env::temp_dir().join(preferred.file_name().unwrap_or_else(|| "frame_hook.log".as_ref()));
  let log_file = [preferred, fallback].into_iter().find_map(|path| File::create(&path).ok().map(|file| (file, path)));

  let path = log_file.map(|(file, path)| {
    loggers.push(WriteLogger::new(level, config, file));
    path
  });

  CombinedLogger::init(loggers).map_err(|e| HookError::InvalidState(format!("logger already set: {e}")))?;
  Ok(path)
}
