use std::path::PathBuf;

use crate::{Result, TeeError};

pub const DEFAULT_BUFSIZE: usize = 1024;

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub names: Vec<String>,
    pub bufsize: usize,
}

impl Config {
    pub fn new(source: PathBuf, name_list: &str, bufsize: usize) -> Result<Self> {
        let names = split_names(name_list);
        if names.is_empty() {
            return Err(TeeError::Config("device names required".into()));
        }
        if bufsize == 0 {
            return Err(TeeError::Config("bufsize must be nonzero".into()));
        }
        Ok(Config {
            source,
            names,
            bufsize,
        })
    }
}

/// Comma-separated device names; empty tokens are dropped.
fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}
