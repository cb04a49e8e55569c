//! Stored login credentials: `~/.catty/credentials.json`, mode 0600.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    fn expired(&self) -> bool {
        self.expires_at
            .map(|expires| expires <= Utc::now())
            .unwrap_or(false)
    }
}

fn credentials_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".catty"))
}

fn credentials_path() -> Result<PathBuf> {
    Ok(credentials_dir()?.join("credentials.json"))
}

pub fn save(credentials: &Credentials) -> Result<()> {
    let dir = credentials_dir()?;
    fs::create_dir_all(&dir).context("create credentials directory")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
    }

    let data = serde_json::to_vec_pretty(credentials).context("serialize credentials")?;
    let path = credentials_path()?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path).context("open credentials file")?;
    file.write_all(&data).context("write credentials")?;
    Ok(())
}

pub fn load() -> Result<Option<Credentials>> {
    let path = credentials_path()?;
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("read credentials"),
    };
    let credentials = serde_json::from_slice(&data).context("parse credentials")?;
    Ok(Some(credentials))
}

pub fn delete() -> Result<()> {
    let path = credentials_path()?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context("remove credentials"),
    }
}

pub fn is_logged_in() -> bool {
    match load() {
        Ok(Some(credentials)) => !credentials.expired() && !credentials.access_token.is_empty(),
        _ => false,
    }
}

pub fn access_token() -> Option<String> {
    load()
        .ok()
        .flatten()
        .filter(|credentials| !credentials.expired())
        .map(|credentials| credentials.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The credentials path hangs off $HOME, so tests point HOME at a
    // scratch directory. Serialized with a lock: env vars are process-wide.
    static HOME_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_temp_home<T>(test: impl FnOnce() -> T) -> T {
        let _guard = HOME_LOCK.lock().unwrap();
        let home = tempfile::tempdir().expect("temp home");
        let previous = std::env::var_os("HOME");
        std::env::set_var("HOME", home.path());
        let result = test();
        match previous {
            Some(value) => std::env::set_var("HOME", value),
            None => std::env::remove_var("HOME"),
        }
        result
    }

    #[test]
    fn round_trips_and_restricts_mode() {
        with_temp_home(|| {
            let credentials = Credentials {
                access_token: "tok_123".into(),
                user_id: "user_1".into(),
                email: "dev@example.test".into(),
                expires_at: None,
            };
            save(&credentials).expect("save");

            let loaded = load().expect("load").expect("present");
            assert_eq!(loaded.access_token, "tok_123");
            assert_eq!(loaded.email, "dev@example.test");

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = fs::metadata(credentials_path().unwrap())
                    .unwrap()
                    .permissions()
                    .mode();
                assert_eq!(mode & 0o777, 0o600);
            }

            assert!(is_logged_in());
            delete().expect("delete");
            assert!(load().expect("load").is_none());
            assert!(!is_logged_in());
        });
    }

    #[test]
    fn expired_credentials_do_not_count_as_logged_in() {
        with_temp_home(|| {
            let credentials = Credentials {
                access_token: "tok_123".into(),
                user_id: String::new(),
                email: String::new(),
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            };
            save(&credentials).expect("save");
            assert!(!is_logged_in());
            assert!(access_token().is_none());
        });
    }
}
