use std::env;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

const LOCAL_ENV: &str = "config/local.env";

/// Export `KEY=VALUE` lines from `config/local.env` that are not already set.
pub fn load_local_env_overrides() {
    load_env_file(Path::new(LOCAL_ENV));
}

fn load_env_file(path: &Path) {
    if !path.exists() {
        return;
    }

    match fs::read_to_string(path) {
        Ok(contents) => {
            for (idx, raw_line) in contents.lines().enumerate() {
                let line = raw_line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    warn!(target: "framecast", line = idx + 1, "invalid local.env entry; skipping");
                    continue;
                };
                let key = key.trim();
                if key.is_empty() || env::var(key).is_ok() {
                    continue;
                }
                env::set_var(key, unquote(value.trim()));
            }
            info!(target: "framecast", path = %path.display(), "loaded environment overrides");
        }
        Err(err) => {
            warn!(target: "framecast", path = %path.display(), ?err, "failed to read environment overrides");
        }
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"")
    } else {
        value.to_string()
    }
}
